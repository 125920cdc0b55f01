//! Services started through lockdownd
//!
//! `StartService` hands back a [`ServiceDescriptor`]; opening it yields a
//! [`Channel`] to the service port which the typed clients below wrap.

use crate::channel::Channel;

pub mod afc;
pub mod debugserver;
pub mod heartbeat;
pub mod house_arrest;
pub mod image_mounter;
pub mod installation_proxy;
pub mod misagent;
pub mod springboard;

/// Where a started service listens. It can be opened once, which is why the
/// type is neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    port: u16,
    ssl: bool,
    identifier: String,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(port: u16, ssl: bool, identifier: impl Into<String>) -> Self {
        Self {
            port,
            ssl,
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the service channel must be upgraded to TLS before use
    #[must_use]
    pub const fn ssl_required(&self) -> bool {
        self.ssl
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// A client for a service lockdownd can start
pub trait LockdownService: Sized {
    /// Identifier passed to `StartService`
    const SERVICE_NAME: &'static str;

    /// Identifiers tried in order when [`Self::SERVICE_NAME`] is refused
    const FALLBACK_NAMES: &'static [&'static str] = &[];

    /// Wraps a channel connected to the service port
    fn from_channel(channel: Channel) -> Self;
}
