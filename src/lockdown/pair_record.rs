use plist::{Dictionary, Value};

use crate::{
    codec::{self, PlistFormat},
    error::{Error, Result},
};

/// Host and device identities established by pairing
///
/// Certificates and keys are PEM bytes. The daemon stores the whole record,
/// the device only ever sees the public half (see [`Self::to_request`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairRecord {
    pub device_certificate: Vec<u8>,
    pub host_certificate: Vec<u8>,
    pub root_certificate: Vec<u8>,
    pub host_private_key: Option<Vec<u8>>,
    pub root_private_key: Option<Vec<u8>>,
    pub host_id: String,
    pub system_buid: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
}

fn data(dict: &Dictionary, key: &'static str) -> Result<Vec<u8>> {
    optional_data(dict, key)?.ok_or_else(|| Error::InvalidPairRecord(format!("no `{key}`")))
}

fn optional_data(dict: &Dictionary, key: &'static str) -> Result<Option<Vec<u8>>> {
    match dict.get(key) {
        None => Ok(None),
        Some(Value::Data(bytes)) => Ok(Some(bytes.clone())),
        // some tools store PEM blobs as strings
        Some(Value::String(s)) => Ok(Some(s.clone().into_bytes())),
        Some(_) => Err(Error::InvalidPairRecord(format!("`{key}` is not data"))),
    }
}

fn string(dict: &Dictionary, key: &'static str) -> Result<String> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidPairRecord(format!("no `{key}` string")))
}

impl PairRecord {
    pub fn from_dictionary(dict: &Dictionary) -> Result<Self> {
        Ok(Self {
            device_certificate: data(dict, "DeviceCertificate")?,
            host_certificate: data(dict, "HostCertificate")?,
            root_certificate: data(dict, "RootCertificate")?,
            host_private_key: optional_data(dict, "HostPrivateKey")?,
            root_private_key: optional_data(dict, "RootPrivateKey")?,
            host_id: string(dict, "HostID")?,
            system_buid: string(dict, "SystemBUID")?,
            escrow_bag: optional_data(dict, "EscrowBag")?,
            wifi_mac_address: dict
                .get("WiFiMACAddress")
                .and_then(Value::as_string)
                .map(str::to_string),
        })
    }

    /// Parses the blob usbmuxd returns from `ReadPairRecord`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let dict: Dictionary = codec::read_document(bytes)?;
        Self::from_dictionary(&dict)
    }

    /// Every field, as stored by the daemon
    #[must_use]
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = self.to_request();

        let optional = [
            ("HostPrivateKey", &self.host_private_key),
            ("RootPrivateKey", &self.root_private_key),
            ("EscrowBag", &self.escrow_bag),
        ];
        for (key, value) in optional {
            if let Some(bytes) = value {
                dict.insert(key.into(), Value::Data(bytes.clone()));
            }
        }

        if let Some(mac) = &self.wifi_mac_address {
            dict.insert("WiFiMACAddress".into(), mac.clone().into());
        }

        dict
    }

    pub fn to_bytes(&self, format: PlistFormat) -> Result<Vec<u8>> {
        codec::write_document(&self.to_dictionary(), format)
    }

    /// The public part sent inside `Pair`, `ValidatePair` and `Unpair` requests
    #[must_use]
    pub fn to_request(&self) -> Dictionary {
        let mut dict = Dictionary::new();

        dict.insert(
            "DeviceCertificate".into(),
            Value::Data(self.device_certificate.clone()),
        );
        dict.insert(
            "HostCertificate".into(),
            Value::Data(self.host_certificate.clone()),
        );
        dict.insert(
            "RootCertificate".into(),
            Value::Data(self.root_certificate.clone()),
        );
        dict.insert("HostID".into(), self.host_id.clone().into());
        dict.insert("SystemBUID".into(), self.system_buid.clone().into());

        dict
    }
}
