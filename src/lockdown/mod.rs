//! lockdownd client
//!
//! lockdownd listens on port 62078 of every device. It answers key/value
//! queries, handles pairing, and starts the other services. A client moves
//! through `Connected -> SessionActive -> Connected` with
//! [`LockdownClient::start_session`] and [`LockdownClient::stop_session`];
//! [`LockdownClient::goodbye`] (or dropping the client) ends the connection.
//!
//! Domain queries and service starts need an active session, the client
//! refuses them locally with [`LockdownError::NoRunningSession`] otherwise.

use plist::{Dictionary, Value};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    channel::Channel,
    codec,
    error::{Error, Result},
    service::ServiceDescriptor,
};

mod error;
mod pair_record;
mod pairing;

pub use error::LockdownError;
pub use pair_record::PairRecord;
pub use pairing::{PairRecordStore, generate_pair_record};

/// `Type` returned by `QueryType` when talking to lockdownd
pub const LOCKDOWN_SERVICE_TYPE: &str = "com.apple.mobile.lockdown";

const PAIRING_PROTOCOL_VERSION: &str = "2";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl SessionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    ssl: bool,
}

#[derive(Debug)]
pub struct LockdownClient {
    channel: Channel,
    label: String,
    session: Option<Session>,
    pair_record: Option<PairRecord>,
    store: Option<PairRecordStore>,
    connected: bool,
}

impl LockdownClient {
    /// Wraps `channel` and checks with `QueryType` that lockdownd is on the other end
    pub async fn connect(channel: Channel, label: impl Into<String>) -> Result<Self> {
        let mut client = Self::without_handshake(channel, label);

        let kind = client.query_type().await?;
        if kind != LOCKDOWN_SERVICE_TYPE {
            tracing::warn!(%kind, "peer is not lockdownd");
            return Err(LockdownError::HandshakeFailed.into());
        }

        tracing::info!(label = %client.label, "connected to lockdownd");
        Ok(client)
    }

    /// Wraps `channel` without sending `QueryType`
    pub fn without_handshake(channel: Channel, label: impl Into<String>) -> Self {
        Self {
            channel,
            label: label.into(),
            session: None,
            pair_record: None,
            store: None,
            connected: true,
        }
    }

    /// Lets pairing calls without an explicit record fall back to the
    /// daemon's copy, and saves records produced by [`Self::pair`]
    #[must_use]
    pub fn with_pair_record_store(mut self, store: PairRecordStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn pair_record_store(&self) -> Option<&PairRecordStore> {
        self.store.as_ref()
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The active session, if any
    #[must_use]
    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| &s.id)
    }

    /// Whether the active session runs over TLS
    #[must_use]
    pub fn session_ssl(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ssl)
    }

    /// The record the session was started with, if one was given
    #[must_use]
    pub fn pair_record(&self) -> Option<&PairRecord> {
        self.pair_record.as_ref()
    }

    #[must_use]
    pub fn into_channel(self) -> Channel {
        self.channel
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn ensure_session(&self) -> Result<&Session> {
        self.ensure_connected()?;
        self.session
            .as_ref()
            .ok_or_else(|| LockdownError::NoRunningSession.into())
    }

    /// Sends `Request: name` with `fields` and returns the reply, mapping a
    /// reply `Error` into [`LockdownError`]
    async fn request(&mut self, name: &str, fields: Dictionary) -> Result<Dictionary> {
        self.ensure_connected()?;

        let mut request = Dictionary::new();
        request.insert("Label".into(), self.label.clone().into());
        request.insert("Request".into(), name.into());
        for (key, value) in fields {
            request.insert(key, value);
        }

        tracing::debug!(request = name, "lockdown request");
        self.channel.send_plist(&request).await?;

        let response: Dictionary = self.channel.recv_plist().await?;

        if let Some(error) = response.get("Error").and_then(Value::as_string) {
            tracing::debug!(request = name, error, "lockdown error");
            return Err(LockdownError::from_device(error).into());
        }

        Ok(response)
    }

    /// Sends an arbitrary value over the lockdown connection
    pub async fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.ensure_connected()?;
        self.channel.send_plist(value).await
    }

    /// Receives an arbitrary value from the lockdown connection
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.ensure_connected()?;
        self.channel.recv_plist().await
    }

    pub async fn query_type(&mut self) -> Result<String> {
        let response = self.request("QueryType", Dictionary::new()).await?;

        response
            .get("Type")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or(Error::MissingField("Type"))
    }

    /// Reads `key` of `domain`, both optional. Without a key the whole domain
    /// comes back as a dictionary.
    pub async fn get_value(&mut self, domain: Option<&str>, key: Option<&str>) -> Result<Value> {
        self.ensure_session()?;

        let mut fields = Dictionary::new();
        if let Some(domain) = domain {
            fields.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            fields.insert("Key".into(), key.into());
        }

        let mut response = self.request("GetValue", fields).await?;
        response
            .remove("Value")
            .ok_or_else(|| LockdownError::MissingValue.into())
    }

    /// [`Self::get_value`] decoded into `T`
    pub async fn get_value_as<T: DeserializeOwned>(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<T> {
        let value = self.get_value(domain, key).await?;
        codec::from_value(&value)
    }

    /// Sets `key` of `domain`, `None` removes the key instead
    pub async fn set_value(&mut self, domain: &str, key: &str, value: Option<Value>) -> Result<()> {
        self.ensure_session()?;

        let mut fields = Dictionary::new();
        fields.insert("Domain".into(), domain.into());
        fields.insert("Key".into(), key.into());

        match value {
            Some(value) => {
                fields.insert("Value".into(), value);
                self.request("SetValue", fields).await?;
            }
            None => {
                self.request("RemoveValue", fields).await?;
            }
        }

        Ok(())
    }

    pub async fn device_udid(&mut self) -> Result<String> {
        self.get_value_as(None, Some("UniqueDeviceID")).await
    }

    pub async fn device_name(&mut self) -> Result<String> {
        self.get_value_as(None, Some("DeviceName")).await
    }

    /// Data classes the device can sync, empty when the key is absent
    pub async fn sync_data_classes(&mut self) -> Result<Vec<String>> {
        match self
            .get_value_as(Some("com.apple.mobile.sync"), Some("SupportedDataClasses"))
            .await
        {
            Err(Error::Lockdown(LockdownError::MissingValue | LockdownError::MissingKey)) => {
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Starts a session, returning its id and whether the device asked for TLS
    pub async fn start_session(
        &mut self,
        host_id: &str,
        system_buid: &str,
    ) -> Result<(SessionId, bool)> {
        self.ensure_connected()?;
        if self.session.is_some() {
            return Err(LockdownError::SessionActive.into());
        }

        let mut fields = Dictionary::new();
        fields.insert("HostID".into(), host_id.into());
        fields.insert("SystemBUID".into(), system_buid.into());

        let response = self.request("StartSession", fields).await?;

        let id = response
            .get("SessionID")
            .and_then(Value::as_string)
            .filter(|id| !id.is_empty())
            .map(|id| SessionId(id.to_string()))
            .ok_or(LockdownError::MissingSessionID)?;
        let ssl = response
            .get("EnableSessionSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        tracing::info!(session = %id, ssl, "lockdown session started");

        self.session = Some(Session {
            id: id.clone(),
            ssl,
        });

        Ok((id, ssl))
    }

    /// Starts a session with the identity in `record` and switches the channel
    /// to TLS when the device asks for it
    pub async fn start_session_with_record(
        &mut self,
        record: &PairRecord,
    ) -> Result<(SessionId, bool)> {
        let (id, ssl) = self
            .start_session(&record.host_id, &record.system_buid)
            .await?;

        if ssl && let Err(e) = self.channel.enable_tls(record).await {
            tracing::warn!(error = %e, "tls upgrade of the lockdown session failed");
            self.session = None;
            return Err(e);
        }

        self.pair_record = Some(record.clone());
        Ok((id, ssl))
    }

    /// Stops the active session. An `id` other than the active one is refused
    /// locally with [`LockdownError::InvalidSessionID`].
    pub async fn stop_session(&mut self, id: &SessionId) -> Result<()> {
        let session = self.ensure_session()?;
        if session.id != *id {
            return Err(LockdownError::InvalidSessionID.into());
        }
        let ssl = session.ssl;

        let mut fields = Dictionary::new();
        fields.insert("SessionID".into(), id.as_str().into());
        self.request("StopSession", fields).await?;

        self.session = None;
        if ssl {
            self.channel.disable_tls()?;
        }

        tracing::info!(session = %id, "lockdown session stopped");
        Ok(())
    }

    /// Asks lockdownd to start `identifier`, optionally unlocking it with the
    /// escrow bag of the session's pair record
    pub async fn start_service(
        &mut self,
        identifier: &str,
        escrow_bag: bool,
    ) -> Result<ServiceDescriptor> {
        self.ensure_session()?;

        let mut fields = Dictionary::new();
        fields.insert("Service".into(), identifier.into());

        if escrow_bag {
            let bag = self
                .pair_record
                .as_ref()
                .and_then(|r| r.escrow_bag.clone())
                .ok_or(LockdownError::MissingEscrowBag)?;
            fields.insert("EscrowBag".into(), Value::Data(bag));
        }

        let response = self.request("StartService", fields).await?;

        let port = response
            .get("Port")
            .and_then(Value::as_unsigned_integer)
            .ok_or(Error::MissingField("Port"))?;
        let port = u16::try_from(port)
            .map_err(|_| Error::unexpected(format!("service port {port} is out of range")))?;
        let ssl = response
            .get("EnableServiceSSL")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        tracing::debug!(service = identifier, port, ssl, "service started");
        Ok(ServiceDescriptor::new(port, ssl, identifier))
    }

    fn pair_fields(record: &PairRecord) -> Dictionary {
        let mut fields = Dictionary::new();
        fields.insert("PairRecord".into(), Value::Dictionary(record.to_request()));
        fields.insert("ProtocolVersion".into(), PAIRING_PROTOCOL_VERSION.into());
        fields
    }

    fn store(&self) -> Result<&PairRecordStore> {
        self.store
            .as_ref()
            .ok_or_else(|| LockdownError::NoPairRecordStore.into())
    }

    /// The record usbmuxd keeps for this device
    pub async fn stored_pair_record(&self) -> Result<PairRecord> {
        self.store()?.load().await
    }

    /// Reads a single value without requiring a session, lockdownd answers
    /// pairing related keys before any session exists
    async fn value_before_session(&mut self, key: &str) -> Result<Value> {
        let mut fields = Dictionary::new();
        fields.insert("Key".into(), key.into());

        let mut response = self.request("GetValue", fields).await?;
        response
            .remove("Value")
            .ok_or_else(|| LockdownError::MissingValue.into())
    }

    /// Mints a new host identity for this device, with the daemon's
    /// `SystemBUID` and a random `HostID`
    pub async fn generate_pair_record(&mut self) -> Result<PairRecord> {
        let system_buid = self.store()?.system_buid().await?;

        let public_key = match self.value_before_session("DevicePublicKey").await? {
            Value::Data(bytes) => bytes,
            Value::String(pem) => pem.into_bytes(),
            _ => return Err(Error::unexpected("`DevicePublicKey` is not data")),
        };

        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        let mut record = generate_pair_record(&public_key, host_id, system_buid)?;

        record.wifi_mac_address = match self.value_before_session("WiFiAddress").await {
            Ok(Value::String(mac)) => Some(mac),
            _ => None,
        };

        Ok(record)
    }

    /// Pairs with the device and returns the record including the
    /// `EscrowBag` the device handed out. Without `record` a new identity is
    /// generated. With a pair record store the result is saved to usbmuxd.
    ///
    /// Until the user answers the trust dialog the device replies with
    /// [`LockdownError::PairingDialogResponsePending`].
    pub async fn pair(&mut self, record: Option<&PairRecord>) -> Result<PairRecord> {
        let mut record = match record {
            Some(record) => record.clone(),
            None => self.generate_pair_record().await?,
        };

        let mut fields = Self::pair_fields(&record);
        fields.insert(
            "PairingOptions".into(),
            plist_macro::plist!({ "ExtendedPairingErrors": true }),
        );

        let response = self.request("Pair", fields).await?;
        if let Some(bag) = response.get("EscrowBag").and_then(Value::as_data) {
            record.escrow_bag = Some(bag.to_vec());
        }

        if let Some(store) = &self.store {
            store.save(&record).await?;
            tracing::info!(udid = store.udid(), host_id = %record.host_id, "pair record saved");
        }

        Ok(record)
    }

    pub async fn validate_pair(&mut self, record: &PairRecord) -> Result<()> {
        self.request("ValidatePair", Self::pair_fields(record))
            .await?;
        Ok(())
    }

    /// [`Self::validate_pair`] with the record usbmuxd keeps for this device
    pub async fn validate_internal(&mut self) -> Result<()> {
        let record = self.stored_pair_record().await?;
        self.validate_pair(&record).await
    }

    /// Removes the pairing, with the daemon's record when `record` is `None`.
    /// The daemon's copy is deleted afterwards.
    pub async fn unpair(&mut self, record: Option<&PairRecord>) -> Result<()> {
        let record = match record {
            Some(record) => record.clone(),
            None => self.stored_pair_record().await?,
        };

        self.request("Unpair", Self::pair_fields(&record)).await?;

        if let Some(store) = &self.store
            && let Err(e) = store.delete().await
        {
            tracing::warn!(udid = store.udid(), error = %e, "deleting the pair record failed");
        }

        Ok(())
    }

    pub async fn activate(&mut self, activation_record: Dictionary) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert(
            "ActivationRecord".into(),
            Value::Dictionary(activation_record),
        );

        self.request("Activate", fields).await?;
        Ok(())
    }

    pub async fn deactivate(&mut self) -> Result<()> {
        self.request("Deactivate", Dictionary::new()).await?;
        Ok(())
    }

    pub async fn enter_recovery(&mut self) -> Result<()> {
        self.request("EnterRecovery", Dictionary::new()).await?;
        Ok(())
    }

    /// Says goodbye and closes the channel, later requests fail with
    /// [`Error::NotConnected`]
    pub async fn goodbye(&mut self) -> Result<()> {
        let result = self.request("Goodbye", Dictionary::new()).await;

        self.connected = false;
        self.session = None;
        self.channel.close().await?;

        tracing::info!("lockdown connection closed");
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_requests_without_session_never_reach_the_device() {
        let (a, _b) = duplex(1024);
        let mut client = LockdownClient::without_handshake(Channel::new(a), "tests");

        let err = client.get_value(None, Some("DeviceName")).await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoRunningSession));

        let err = client.set_value("d", "k", None).await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoRunningSession));

        let err = client.start_service("com.apple.afc", false).await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoRunningSession));
    }

    #[tokio::test]
    async fn test_pairing_without_record_needs_a_store() {
        let (a, _b) = duplex(1024);
        let mut client = LockdownClient::without_handshake(Channel::new(a), "tests");

        let err = client.pair(None).await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoPairRecordStore));

        let err = client.unpair(None).await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoPairRecordStore));

        let err = client.validate_internal().await.unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::NoPairRecordStore));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_services() {
        let (a, b) = duplex(4096);

        let peer = tokio::spawn(async move {
            let mut device = Channel::new(b);
            let request: Dictionary = device.recv_plist().await.unwrap();
            assert_eq!(
                request.get("Request").and_then(Value::as_string),
                Some("QueryType")
            );
            assert_eq!(
                request.get("Label").and_then(Value::as_string),
                Some("tests")
            );

            device
                .send_plist(&plist_macro::plist!({
                    "Request": "QueryType",
                    "Type": "com.apple.afc",
                }))
                .await
                .unwrap();
        });

        let err = LockdownClient::connect(Channel::new(a), "tests")
            .await
            .unwrap_err();
        assert_eq!(err.as_lockdown(), Some(&LockdownError::HandshakeFailed));

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_device_errors_are_mapped() {
        let (a, b) = duplex(4096);

        tokio::spawn(async move {
            let mut device = Channel::new(b);
            let _: Dictionary = device.recv_plist().await.unwrap();
            device
                .send_plist(&plist_macro::plist!({
                    "Request": "Pair",
                    "Error": "PairingDialogResponsePending",
                }))
                .await
                .unwrap();
        });

        let mut client = LockdownClient::without_handshake(Channel::new(a), "tests");
        let err = client.pair(Some(&PairRecord::default())).await.unwrap_err();
        assert_eq!(
            err.as_lockdown(),
            Some(&LockdownError::PairingDialogResponsePending)
        );
    }
}
