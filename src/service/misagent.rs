//! Provisioning profile management through `com.apple.misagent`

use plist::{Dictionary, Value};

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

const PROFILE_TYPE: &str = "Provisioning";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MisagentError {
    #[error("misagent request failed with status {0:#x}")]
    RequestFailed(u64),
}

#[derive(Debug)]
pub struct MisagentClient {
    channel: Channel,
}

impl LockdownService for MisagentClient {
    const SERVICE_NAME: &'static str = "com.apple.misagent";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl MisagentClient {
    async fn request(&mut self, message_type: &str, mut fields: Dictionary) -> Result<Dictionary> {
        fields.insert("MessageType".into(), message_type.into());
        fields.insert("ProfileType".into(), PROFILE_TYPE.into());

        tracing::debug!(message_type, "misagent request");
        let reply: Dictionary = self.channel.request(&fields).await?;

        match reply.get("Status").and_then(Value::as_unsigned_integer) {
            Some(0) => Ok(reply),
            Some(code) => Err(MisagentError::RequestFailed(code).into()),
            None => Err(Error::MissingField("Status")),
        }
    }

    /// Installs a DER encoded provisioning profile
    pub async fn install(&mut self, profile: &[u8]) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("Profile".into(), Value::Data(profile.to_vec()));

        self.request("Install", fields).await?;
        Ok(())
    }

    /// Installed profiles, the `Copy` form older devices understand
    pub async fn copy(&mut self) -> Result<Vec<Vec<u8>>> {
        let reply = self.request("Copy", Dictionary::new()).await?;
        payload(reply)
    }

    /// Every installed profile, including ones `copy` leaves out
    pub async fn copy_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let reply = self.request("CopyAll", Dictionary::new()).await?;
        payload(reply)
    }

    /// Removes the profile with UUID `id`
    pub async fn remove(&mut self, id: &str) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("ProfileID".into(), id.into());

        self.request("Remove", fields).await?;
        Ok(())
    }
}

fn payload(mut reply: Dictionary) -> Result<Vec<Vec<u8>>> {
    match reply.remove("Payload") {
        Some(Value::Array(profiles)) => Ok(profiles
            .into_iter()
            .filter_map(|p| match p {
                Value::Data(bytes) => Some(bytes),
                _ => None,
            })
            .collect()),
        _ => Err(Error::MissingField("Payload")),
    }
}
