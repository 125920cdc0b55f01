//! `com.apple.mobile.heartbeat`, keeps network connections to a device alive
//!
//! The device sends `{Command: Marco, Interval: n}` every `n` seconds and
//! expects `{Command: Polo}` back. `SleepyTime` means it is going to sleep.

use std::time::Duration;

use plist::{Dictionary, Value};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("device is going to sleep")]
    SleepyTime,
    #[error("unexpected heartbeat command `{0}`")]
    UnexpectedCommand(String),
}

#[derive(Debug)]
pub struct HeartbeatClient {
    channel: Channel,
}

impl LockdownService for HeartbeatClient {
    const SERVICE_NAME: &'static str = "com.apple.mobile.heartbeat";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl HeartbeatClient {
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.channel.send_plist(value).await
    }

    /// Receives one message, failing with [`Error::Timeout`] once `timeout`
    /// passes
    pub async fn receive<T: DeserializeOwned>(&mut self, timeout: Option<Duration>) -> Result<T> {
        match timeout {
            Some(timeout) => self.channel.recv_plist_timeout(timeout).await,
            None => self.channel.recv_plist().await,
        }
    }

    /// Answers one `Marco` with `Polo`, returning the interval the device
    /// announced for the next one
    pub async fn serve_once(&mut self, timeout: Option<Duration>) -> Result<Option<Duration>> {
        let message: Dictionary = self.receive(timeout).await?;

        let command = message
            .get("Command")
            .and_then(Value::as_string)
            .ok_or(Error::MissingField("Command"))?;

        match command {
            "Marco" => {
                self.send(&plist_macro::plist!({ "Command": "Polo" })).await?;

                let interval = message
                    .get("Interval")
                    .and_then(Value::as_unsigned_integer)
                    .map(Duration::from_secs);
                tracing::debug!(?interval, "heartbeat answered");

                Ok(interval)
            }
            "SleepyTime" => Err(HeartbeatError::SleepyTime.into()),
            other => Err(HeartbeatError::UnexpectedCommand(other.to_string()).into()),
        }
    }
}
