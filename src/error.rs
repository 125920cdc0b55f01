//! Error types for lockmux
//!
//! Transport failures, codec failures and local invariant violations live in
//! [`Error`] directly. Every remote protocol has its own status enum (lockdown,
//! AFC, installation proxy, ...) which is wrapped by a dedicated variant.

use std::{io, time::Duration};

use crate::{
    lockdown::LockdownError,
    parser::usbmux::UsbMuxResult,
    service::{
        afc::AfcError,
        debugserver::DebugserverError,
        heartbeat::HeartbeatError,
        house_arrest::HouseArrestError,
        image_mounter::ImageMounterError,
        installation_proxy::InstallStatusError,
        misagent::MisagentError,
    },
};

/// Main error type for lockmux operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // === Transport Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("usbmuxd is unreachable at {address}: {source}")]
    TransportUnavailable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("usbmuxd rejected the request: {code}")]
    ConnectionRefused { code: UsbMuxResult },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection is closed")]
    NotConnected,

    // === Codec Errors ===
    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("invalid pair record: {0}")]
    InvalidPairRecord(String),

    // === Local Invariant Violations ===
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("response is missing `{0}`")]
    MissingField(&'static str),

    // === Protocol Errors ===
    #[error("lockdown: {0}")]
    Lockdown(#[from] LockdownError),

    #[error("afc: {0}")]
    Afc(#[from] AfcError),

    #[error("installation failed: {0}")]
    InstallStatus(#[from] InstallStatusError),

    #[error("heartbeat: {0}")]
    Heartbeat(#[from] HeartbeatError),

    #[error("debugserver: {0}")]
    Debugserver(#[from] DebugserverError),

    #[error("misagent: {0}")]
    Misagent(#[from] MisagentError),

    #[error("house arrest: {0}")]
    HouseArrest(#[from] HouseArrestError),

    #[error("image mounter: {0}")]
    ImageMounter(#[from] ImageMounterError),
}

impl Error {
    /// Create an unexpected response error
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// The lockdown status carried by this error, if it is one
    pub fn as_lockdown(&self) -> Option<&LockdownError> {
        match self {
            Self::Lockdown(e) => Some(e),
            _ => None,
        }
    }

    /// The AFC status carried by this error, if it is one
    pub fn as_afc(&self) -> Option<&AfcError> {
        match self {
            Self::Afc(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
