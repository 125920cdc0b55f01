use std::{env, fmt, net::SocketAddr, path::PathBuf, time::Duration};

use crate::{
    codec::PlistFormat,
    error::{Error, Result},
};

/// Where usbmuxd listens on unix systems
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/usbmuxd";

/// Where usbmuxd listens on systems without unix sockets
pub const DEFAULT_TCP_ADDRESS: &str = "127.0.0.1:27015";

/// Overrides the daemon address, either `UNIX:/some/path` or `host:port`
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// The port lockdownd listens on inside the device
pub const LOCKDOWN_PORT: u16 = 62078;

const DEFAULT_PROG_NAME: &str = "lockmux";

/// Address of the multiplexing daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbMuxAddress {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP address, used on platforms without unix sockets or for remote daemons
    Tcp(SocketAddr),
}

impl UsbMuxAddress {
    /// Parses `UNIX:/path`, a bare absolute path, or `host:port`
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(path) = value.strip_prefix("UNIX:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if value.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(value)));
        }

        value
            .parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|e| Error::unexpected(format!("invalid usbmuxd address `{value}`: {e}")))
    }

    /// Reads [`SOCKET_ADDRESS_ENV`], falling back to the platform default
    pub fn from_env() -> Result<Self> {
        match env::var(SOCKET_ADDRESS_ENV) {
            Ok(value) if !value.is_empty() => Self::parse(&value),
            _ => Ok(Self::default()),
        }
    }
}

impl Default for UsbMuxAddress {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
        } else {
            Self::Tcp(
                DEFAULT_TCP_ADDRESS
                    .parse()
                    .expect("the default tcp address is a valid socket address"),
            )
        }
    }
}

impl fmt::Display for UsbMuxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "UNIX:{}", path.display()),
            Self::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Configuration shared by the usbmux, lockdown and service clients
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon address
    pub address: UsbMuxAddress,
    /// `ProgName` sent to usbmuxd
    pub prog_name: String,
    /// `Label` sent with every lockdown request
    pub label: String,
    /// Receive timeout applied to every response read, `None` waits forever
    pub timeout: Option<Duration>,
    /// Encoding used for outgoing device plists
    pub plist_format: PlistFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: UsbMuxAddress::default(),
            prog_name: DEFAULT_PROG_NAME.to_string(),
            label: DEFAULT_PROG_NAME.to_string(),
            timeout: None,
            plist_format: PlistFormat::Binary,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration whose address comes from the environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().with_address(UsbMuxAddress::from_env()?))
    }

    /// Set the daemon address
    pub fn with_address(mut self, address: UsbMuxAddress) -> Self {
        self.address = address;
        self
    }

    /// Set the program name reported to usbmuxd
    pub fn with_prog_name<S: Into<String>>(mut self, prog_name: S) -> Self {
        self.prog_name = prog_name.into();
        self
    }

    /// Set the lockdown label
    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }

    /// Set the receive timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the outgoing plist encoding
    pub fn with_plist_format(mut self, plist_format: PlistFormat) -> Self {
        self.plist_format = plist_format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_address() {
        let addr = UsbMuxAddress::parse("UNIX:/tmp/usbmuxd").unwrap();
        assert_eq!(addr, UsbMuxAddress::Unix(PathBuf::from("/tmp/usbmuxd")));
        assert_eq!(addr.to_string(), "UNIX:/tmp/usbmuxd");
    }

    #[test]
    fn test_parse_tcp_address() {
        let addr = UsbMuxAddress::parse("127.0.0.1:27015").unwrap();
        assert!(matches!(addr, UsbMuxAddress::Tcp(a) if a.port() == 27015));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(UsbMuxAddress::parse("not an address").is_err());
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new()
            .with_label("tests")
            .with_timeout(Duration::from_secs(3))
            .with_plist_format(PlistFormat::Xml);

        assert_eq!(config.label, "tests");
        assert_eq!(config.timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.plist_format, PlistFormat::Xml);
    }
}
