use std::fmt;

use plist::{Dictionary, Value};

use crate::{
    channel::Channel,
    config::LOCKDOWN_PORT,
    error::{Error, Result},
    lockdown::{LockdownClient, LockdownError, PairRecord, PairRecordStore},
    service::{LockdownService, ServiceDescriptor},
    usbmux::UsbMuxClient,
};

/// usbmuxd's `DeviceID`, only meaningful while the device stays attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Usb,
    Network,
}

impl ConnectionType {
    fn from_wire(value: &str) -> Result<Self> {
        match value {
            "USB" => Ok(Self::Usb),
            "Network" => Ok(Self::Network),
            other => Err(Error::unexpected(format!("unknown connection type `{other}`"))),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Network => write!(f, "Network"),
        }
    }
}

/// A device as enumerated by usbmuxd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbMuxDevice {
    pub udid: String,
    pub connection_type: ConnectionType,
    pub handle: DeviceHandle,
    pub product_id: Option<u16>,
    pub location_id: Option<u32>,
    /// raw `sockaddr` bytes for network devices
    pub network_address: Option<Vec<u8>>,
}

impl UsbMuxDevice {
    /// Parses an `Attached` style entry, `{DeviceID, Properties: {...}}`
    pub fn from_entry(entry: &Dictionary) -> Result<Self> {
        let properties = entry
            .get("Properties")
            .and_then(Value::as_dictionary)
            .ok_or(Error::MissingField("Properties"))?;

        let device_id = entry
            .get("DeviceID")
            .or_else(|| properties.get("DeviceID"))
            .and_then(Value::as_unsigned_integer)
            .ok_or(Error::MissingField("DeviceID"))?;

        let udid = properties
            .get("SerialNumber")
            .and_then(Value::as_string)
            .ok_or(Error::MissingField("SerialNumber"))?;

        let connection_type = properties
            .get("ConnectionType")
            .and_then(Value::as_string)
            .map_or(Ok(ConnectionType::Usb), ConnectionType::from_wire)?;

        Ok(Self {
            udid: udid.to_string(),
            connection_type,
            handle: DeviceHandle(device_id as u32),
            product_id: properties
                .get("ProductID")
                .and_then(Value::as_unsigned_integer)
                .map(|id| id as u16),
            location_id: properties
                .get("LocationID")
                .and_then(Value::as_unsigned_integer)
                .map(|id| id as u32),
            network_address: properties
                .get("NetworkAddress")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Removed,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: UsbMuxDevice,
}

/// Which connections a UDID lookup may resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    Only(ConnectionType),
    Both { prefer: ConnectionType },
}

impl Default for LookupMode {
    fn default() -> Self {
        Self::Only(ConnectionType::Usb)
    }
}

impl LookupMode {
    /// Picks the entry for `udid` this mode allows, honoring the preference
    #[must_use]
    pub fn select<'a>(
        &self,
        udid: &str,
        devices: impl IntoIterator<Item = &'a UsbMuxDevice>,
    ) -> Option<&'a UsbMuxDevice> {
        let mut fallback = None;

        for device in devices.into_iter().filter(|d| d.udid == udid) {
            match *self {
                Self::Only(kind) if device.connection_type == kind => return Some(device),
                Self::Only(_) => {}
                Self::Both { prefer } if device.connection_type == prefer => {
                    return Some(device);
                }
                Self::Both { .. } => {
                    fallback.get_or_insert(device);
                }
            }
        }

        fallback
    }
}

/// A device addressed by UDID
///
/// The daemon handle is resolved again on every connection, so a `Device`
/// survives the device being unplugged and plugged back in.
#[derive(Debug, Clone)]
pub struct Device {
    udid: String,
    mode: LookupMode,
    usbmux: UsbMuxClient,
}

impl Device {
    #[must_use]
    pub fn new(usbmux: UsbMuxClient, udid: impl Into<String>, mode: LookupMode) -> Self {
        Self {
            udid: udid.into(),
            mode,
            usbmux,
        }
    }

    /// Like [`Self::new`] but fails with [`Error::NotFound`] unless the device
    /// is currently attached
    pub async fn lookup(
        usbmux: UsbMuxClient,
        udid: impl Into<String>,
        mode: LookupMode,
    ) -> Result<Self> {
        let device = Self::new(usbmux, udid, mode);
        device.resolve().await?;
        Ok(device)
    }

    #[must_use]
    pub fn udid(&self) -> &str {
        &self.udid
    }

    #[must_use]
    pub const fn mode(&self) -> LookupMode {
        self.mode
    }

    #[must_use]
    pub const fn usbmux(&self) -> &UsbMuxClient {
        &self.usbmux
    }

    /// The daemon entry this device currently maps to
    pub async fn resolve(&self) -> Result<UsbMuxDevice> {
        self.usbmux
            .device(&self.udid, self.mode)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device {}", self.udid)))
    }

    /// Opens a raw channel to `port` on the device
    pub async fn connect(&self, port: u16) -> Result<Channel> {
        let entry = self.resolve().await?;
        self.usbmux.connect(entry.handle, port).await
    }

    /// Reads this device's pair record from the daemon
    pub async fn pair_record(&self) -> Result<PairRecord> {
        let bytes = self.usbmux.read_pair_record(&self.udid).await?;
        PairRecord::from_bytes(&bytes)
    }

    /// Connects to lockdownd and performs the `QueryType` handshake. Pairing
    /// calls on the client load and save this device's record through usbmuxd.
    pub async fn lockdown(&self) -> Result<LockdownClient> {
        let entry = self.resolve().await?;
        let channel = self.usbmux.connect(entry.handle, LOCKDOWN_PORT).await?;
        let store = PairRecordStore::new(self.usbmux.clone(), &self.udid, Some(entry.handle));

        let lockdown = LockdownClient::connect(channel, self.usbmux.config().label.clone()).await?;
        Ok(lockdown.with_pair_record_store(store))
    }

    /// Connects to lockdownd and starts a session with the daemon's pair record
    pub async fn lockdown_session(&self) -> Result<LockdownClient> {
        let record = self.pair_record().await?;
        let mut lockdown = self.lockdown().await?;

        lockdown.start_session_with_record(&record).await?;
        Ok(lockdown)
    }

    /// Opens the channel described by `descriptor`, upgrading it to TLS when
    /// the service asks for it
    pub async fn open_service(
        &self,
        descriptor: ServiceDescriptor,
        record: Option<&PairRecord>,
    ) -> Result<Channel> {
        let mut channel = self.connect(descriptor.port()).await?;

        if descriptor.ssl_required() {
            let record = record.ok_or_else(|| {
                Error::InvalidPairRecord(format!(
                    "{} requires TLS but no pair record is available",
                    descriptor.identifier()
                ))
            })?;
            channel.enable_tls(record).await?;
        }

        tracing::debug!(service = descriptor.identifier(), "service channel open");
        Ok(channel)
    }

    /// Starts `S` through an existing lockdown session and opens it
    pub async fn start_service<S: LockdownService>(
        &self,
        lockdown: &mut LockdownClient,
        escrow_bag: bool,
    ) -> Result<S> {
        let names = std::iter::once(S::SERVICE_NAME).chain(S::FALLBACK_NAMES.iter().copied());

        for name in names {
            match lockdown.start_service(name, escrow_bag).await {
                Ok(descriptor) => {
                    let channel = self.open_service(descriptor, lockdown.pair_record()).await?;
                    return Ok(S::from_channel(channel));
                }
                Err(Error::Lockdown(LockdownError::InvalidService)) => {
                    tracing::debug!(service = name, "service refused, trying the next name");
                }
                Err(e) => return Err(e),
            }
        }

        Err(LockdownError::InvalidService.into())
    }

    /// Opens a lockdown session, starts `S`, and closes lockdown again
    pub async fn connect_service<S: LockdownService>(&self) -> Result<S> {
        let mut lockdown = self.lockdown_session().await?;
        let service = self.start_service::<S>(&mut lockdown, false).await?;

        if let Err(e) = lockdown.goodbye().await {
            tracing::debug!(error = %e, "lockdown goodbye failed");
        }

        Ok(service)
    }
}
