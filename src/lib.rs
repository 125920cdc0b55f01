use tokio::io::{AsyncRead, AsyncWrite};

pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod lockdown;
pub mod logging;
pub mod parser;
pub mod service;
pub mod tls;
pub mod usbmux;

pub use channel::Channel;
pub use config::{ClientConfig, UsbMuxAddress};
pub use device::{
    ConnectionType, Device, DeviceEvent, DeviceEventKind, DeviceHandle, LookupMode, UsbMuxDevice,
};
pub use error::{Error, Result};
pub use lockdown::{LockdownClient, LockdownError, PairRecord, SessionId};
pub use service::{LockdownService, ServiceDescriptor};
pub use usbmux::{Subscription, SubscriptionManager, UsbMuxClient};

pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ReadWrite for T {}

pub trait AsyncReading: AsyncRead + Unpin + Send + Sync {}
impl<T: AsyncRead + Unpin + Send + Sync> AsyncReading for T {}

pub trait AsyncWriting: AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncWrite + Unpin + Send + Sync> AsyncWriting for T {}
