//! `com.apple.mobile.house_arrest`
//!
//! After a successful vend the same channel speaks AFC, rooted at the app's
//! container or its `Documents` directory.

use plist::{Dictionary, Value};

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::{LockdownService, afc::AfcClient},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HouseArrestError {
    #[error("no application with that identifier")]
    ApplicationLookupFailed,
    #[error("the installation could not be looked up")]
    InstallationLookupFailed,
    #[error("{0}")]
    Unknown(String),
}

impl HouseArrestError {
    #[must_use]
    pub fn from_device(name: &str) -> Self {
        match name {
            "ApplicationLookupFailed" => Self::ApplicationLookupFailed,
            "InstallationLookupFailed" => Self::InstallationLookupFailed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vend {
    /// the whole app container
    Container,
    /// only `Documents`, allowed for apps with file sharing enabled
    Documents,
}

impl Vend {
    const fn command(self) -> &'static str {
        match self {
            Self::Container => "VendContainer",
            Self::Documents => "VendDocuments",
        }
    }
}

#[derive(Debug)]
pub struct HouseArrestClient {
    channel: Channel,
}

impl LockdownService for HouseArrestClient {
    const SERVICE_NAME: &'static str = "com.apple.mobile.house_arrest";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl HouseArrestClient {
    /// Vends `bundle_id` and hands the channel over to AFC
    pub async fn vend(mut self, what: Vend, bundle_id: &str) -> Result<AfcClient> {
        let mut request = Dictionary::new();
        request.insert("Command".into(), what.command().into());
        request.insert("Identifier".into(), bundle_id.into());

        tracing::debug!(command = what.command(), bundle_id, "house arrest request");
        let reply: Dictionary = self.channel.request(&request).await?;

        if let Some(error) = reply.get("Error").and_then(Value::as_string) {
            return Err(HouseArrestError::from_device(error).into());
        }

        match reply.get("Status").and_then(Value::as_string) {
            Some("Complete") => Ok(AfcClient::new(self.channel)),
            Some(other) => Err(Error::unexpected(format!(
                "house arrest answered with status `{other}`"
            ))),
            None => Err(Error::MissingField("Status")),
        }
    }

    pub async fn vend_container(self, bundle_id: &str) -> Result<AfcClient> {
        self.vend(Vend::Container, bundle_id).await
    }

    pub async fn vend_documents(self, bundle_id: &str) -> Result<AfcClient> {
        self.vend(Vend::Documents, bundle_id).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_lookup_failure() {
        let (a, b) = duplex(4096);
        let client = HouseArrestClient::from_channel(Channel::new(a));
        let mut device = Channel::new(b);

        device
            .send_plist(&plist_macro::plist!({ "Error": "ApplicationLookupFailed" }))
            .await
            .unwrap();

        let err = client.vend_documents("com.example.none").await.unwrap_err();
        assert!(matches!(
            err,
            Error::HouseArrest(HouseArrestError::ApplicationLookupFailed)
        ));

        let request: Dictionary = device.recv_plist().await.unwrap();
        assert_eq!(
            request.get("Command").and_then(Value::as_string),
            Some("VendDocuments")
        );
    }
}
