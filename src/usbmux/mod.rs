//! usbmuxd client
//!
//! Every request opens its own connection to the daemon, sends one plist
//! packet and reads one reply. `Connect` and `Listen` keep their connection:
//! the first becomes a raw [`Channel`], the second an event stream.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use plist::{Dictionary, Value};

use crate::{
    ReadWrite,
    channel::Channel,
    config::{ClientConfig, UsbMuxAddress},
    device::{DeviceHandle, LookupMode, UsbMuxDevice},
    error::{Error, Result},
    parser::usbmux::{self, PayloadMessageType, UsbMuxPacket, UsbMuxResult},
};

mod subscription;

pub use subscription::{Subscription, SubscriptionManager};

#[derive(Debug, Clone)]
pub struct UsbMuxClient {
    config: Arc<ClientConfig>,
    tag: Arc<AtomicU32>,
    subscriptions: Arc<parking_lot::Mutex<std::sync::Weak<SubscriptionManager>>>,
}

impl Default for UsbMuxClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl UsbMuxClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            tag: Arc::new(AtomicU32::new(1)),
            subscriptions: Arc::default(),
        }
    }

    /// A client for the daemon named by `USBMUXD_SOCKET_ADDRESS`
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn next_tag(&self) -> u32 {
        self.tag.fetch_add(1, Ordering::Relaxed)
    }

    async fn open(&self) -> Result<Box<dyn ReadWrite>> {
        let address = &self.config.address;

        let unavailable = |source| Error::TransportUnavailable {
            address: address.to_string(),
            source,
        };

        match address {
            #[cfg(unix)]
            UsbMuxAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unavailable)?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            UsbMuxAddress::Unix(_) => Err(unavailable(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
            UsbMuxAddress::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(unavailable)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn exchange(
        &self,
        stream: &mut Box<dyn ReadWrite>,
        message_type: PayloadMessageType,
        fields: Dictionary,
    ) -> Result<Dictionary> {
        use tokio::io::AsyncWriteExt;

        let tag = self.next_tag();
        let request = usbmux::request(message_type, &self.config.prog_name, fields);

        tracing::debug!(%message_type, tag, "usbmux request");
        stream
            .write_all(&UsbMuxPacket::plist(request, tag).encode())
            .await?;
        stream.flush().await?;

        let reply = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, UsbMuxPacket::parse(stream))
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => UsbMuxPacket::parse(stream).await?,
        };

        if reply.header.tag.get() != tag {
            tracing::debug!(
                expected = tag,
                got = reply.header.tag.get(),
                "usbmux reply tag mismatch"
            );
        }

        reply.into_dictionary()
    }

    async fn request(
        &self,
        message_type: PayloadMessageType,
        fields: Dictionary,
    ) -> Result<Dictionary> {
        let mut stream = self.open().await?;
        self.exchange(&mut stream, message_type, fields).await
    }

    fn check_result(reply: &Dictionary) -> Result<()> {
        match UsbMuxResult::from_message(reply) {
            Some(UsbMuxResult::Ok) | None => Ok(()),
            Some(code) => Err(Error::ConnectionRefused { code }),
        }
    }

    /// Every attached device, empty when there are none
    pub async fn list_devices(&self) -> Result<Vec<UsbMuxDevice>> {
        let reply = self
            .request(PayloadMessageType::ListDevices, Dictionary::new())
            .await?;
        Self::check_result(&reply)?;

        let list = reply
            .get("DeviceList")
            .and_then(Value::as_array)
            .ok_or(Error::MissingField("DeviceList"))?;

        let mut devices = Vec::with_capacity(list.len());
        for entry in list.iter().filter_map(Value::as_dictionary) {
            match UsbMuxDevice::from_entry(entry) {
                Ok(device) => devices.push(device),
                Err(e) => tracing::warn!(error = %e, "skipping malformed device entry"),
            }
        }

        Ok(devices)
    }

    /// Finds the entry for `udid` allowed by `mode`
    pub async fn device(&self, udid: &str, mode: LookupMode) -> Result<Option<UsbMuxDevice>> {
        let devices = self.list_devices().await?;
        Ok(mode.select(udid, &devices).cloned())
    }

    /// Opens a raw channel to `port` of the device behind `handle`
    pub async fn connect(&self, handle: DeviceHandle, port: u16) -> Result<Channel> {
        let mut stream = self.open().await?;

        let mut fields = Dictionary::new();
        fields.insert("DeviceID".into(), u64::from(handle.0).into());
        // usbmuxd expects the port in network byte order
        fields.insert("PortNumber".into(), u64::from(port.to_be()).into());

        let reply = self
            .exchange(&mut stream, PayloadMessageType::Connect, fields)
            .await?;

        match UsbMuxResult::from_message(&reply) {
            Some(UsbMuxResult::Ok) => {
                tracing::info!(%handle, port, "connected to device port");
                Ok(Channel::with_config(stream, &self.config))
            }
            Some(code) => Err(Error::ConnectionRefused { code }),
            None => Err(Error::unexpected("`Connect` was not answered with a result")),
        }
    }

    /// The raw pair record blob for `udid`
    pub async fn read_pair_record(&self, udid: &str) -> Result<Vec<u8>> {
        let mut fields = Dictionary::new();
        fields.insert("PairRecordID".into(), udid.into());

        let mut reply = self
            .request(PayloadMessageType::ReadPairRecord, fields)
            .await?;

        if let Some(code) = UsbMuxResult::from_message(&reply)
            && code != UsbMuxResult::Ok
        {
            return Err(Error::NotFound(format!("pair record for {udid} ({code})")));
        }

        match reply.remove("PairRecordData") {
            Some(Value::Data(bytes)) => Ok(bytes),
            _ => Err(Error::NotFound(format!("pair record for {udid}"))),
        }
    }

    pub async fn save_pair_record(
        &self,
        udid: &str,
        handle: Option<DeviceHandle>,
        record: &[u8],
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("PairRecordID".into(), udid.into());
        fields.insert("PairRecordData".into(), Value::Data(record.to_vec()));
        if let Some(handle) = handle {
            fields.insert("DeviceID".into(), u64::from(handle.0).into());
        }

        let reply = self
            .request(PayloadMessageType::SavePairRecord, fields)
            .await?;
        Self::check_result(&reply)
    }

    pub async fn delete_pair_record(&self, udid: &str) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("PairRecordID".into(), udid.into());

        let reply = self
            .request(PayloadMessageType::DeletePairRecord, fields)
            .await?;
        Self::check_result(&reply)
    }

    /// The daemon's system BUID
    pub async fn read_buid(&self) -> Result<String> {
        let reply = self
            .request(PayloadMessageType::ReadBUID, Dictionary::new())
            .await?;
        Self::check_result(&reply)?;

        reply
            .get("BUID")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or(Error::MissingField("BUID"))
    }

    /// Opens a connection in listen mode, returning the stream that carries events
    pub(crate) async fn listen(&self) -> Result<Box<dyn ReadWrite>> {
        let mut stream = self.open().await?;

        let reply = self
            .exchange(&mut stream, PayloadMessageType::Listen, Dictionary::new())
            .await?;

        match UsbMuxResult::from_message(&reply) {
            Some(UsbMuxResult::Ok) => Ok(stream),
            Some(code) => Err(Error::ConnectionRefused { code }),
            None => Err(Error::unexpected("`Listen` was not answered with a result")),
        }
    }

    /// Subscribes to attach, detach and pair events
    ///
    /// All subscriptions made through clones of this client share one daemon
    /// connection, which lives as long as at least one of them does.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let manager = {
            let mut slot = self.subscriptions.lock();
            match slot.upgrade() {
                Some(manager) => manager,
                None => {
                    let manager = SubscriptionManager::new(self.clone());
                    *slot = Arc::downgrade(&manager);
                    manager
                }
            }
        };

        manager.subscribe().await
    }
}
