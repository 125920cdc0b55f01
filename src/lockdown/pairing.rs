//! Pair record generation and the daemon's copy of it
//!
//! Pairing needs a root certificate, a host certificate signed by it, and a
//! device certificate binding the device's public key to the same root. All
//! three are minted here; the device only ever sees the public halves.

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{HasPublic, PKey, PKeyRef, Private, Public},
    rsa::Rsa,
    x509::{
        X509, X509NameBuilder, X509Ref,
        extension::{BasicConstraints, KeyUsage},
    },
};

use crate::{
    codec::PlistFormat,
    device::DeviceHandle,
    error::{Error, Result},
    lockdown::PairRecord,
    usbmux::UsbMuxClient,
};

const KEY_BITS: u32 = 2048;
const VALIDITY_DAYS: u32 = 365 * 10;

fn certificate<K: HasPublic>(
    serial: u32,
    common_name: &str,
    public_key: &PKeyRef<K>,
    issuer: Option<&X509Ref>,
    signer: &PKeyRef<Private>,
) -> Result<X509> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }
    builder.set_pubkey(public_key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if issuer.is_none() {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    } else {
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
    }

    builder.sign(signer, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Parses lockdownd's `DevicePublicKey`, a PKCS#1 PEM on every device seen so
/// far, with SubjectPublicKeyInfo PEM accepted too
fn device_key(pem: &[u8]) -> Result<PKey<Public>> {
    let rsa = Rsa::public_key_from_pem_pkcs1(pem)
        .or_else(|_| Rsa::public_key_from_pem(pem))
        .map_err(|e| Error::InvalidPairRecord(format!("bad `DevicePublicKey`: {e}")))?;

    Ok(PKey::from_rsa(rsa)?)
}

/// Mints a fresh root and host identity and a device certificate for
/// `device_public_key`
pub fn generate_pair_record(
    device_public_key: &[u8],
    host_id: impl Into<String>,
    system_buid: impl Into<String>,
) -> Result<PairRecord> {
    let device_key = device_key(device_public_key)?;
    let root_key = PKey::from_rsa(Rsa::generate(KEY_BITS)?)?;
    let host_key = PKey::from_rsa(Rsa::generate(KEY_BITS)?)?;

    let root = certificate(1, "Root", &*root_key, None, &*root_key)?;
    let host = certificate(2, "Host", &*host_key, Some(&*root), &*root_key)?;
    let device = certificate(3, "Device", &*device_key, Some(&*root), &*root_key)?;

    Ok(PairRecord {
        device_certificate: device.to_pem()?,
        host_certificate: host.to_pem()?,
        root_certificate: root.to_pem()?,
        host_private_key: Some(host_key.private_key_to_pem_pkcs8()?),
        root_private_key: Some(root_key.private_key_to_pem_pkcs8()?),
        host_id: host_id.into(),
        system_buid: system_buid.into(),
        escrow_bag: None,
        wifi_mac_address: None,
    })
}

/// The pair record usbmuxd keeps for one device
#[derive(Debug, Clone)]
pub struct PairRecordStore {
    usbmux: UsbMuxClient,
    udid: String,
    handle: Option<DeviceHandle>,
}

impl PairRecordStore {
    #[must_use]
    pub fn new(
        usbmux: UsbMuxClient,
        udid: impl Into<String>,
        handle: Option<DeviceHandle>,
    ) -> Self {
        Self {
            usbmux,
            udid: udid.into(),
            handle,
        }
    }

    #[must_use]
    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub async fn system_buid(&self) -> Result<String> {
        self.usbmux.read_buid().await
    }

    pub async fn load(&self) -> Result<PairRecord> {
        let bytes = self.usbmux.read_pair_record(&self.udid).await?;
        PairRecord::from_bytes(&bytes)
    }

    pub async fn save(&self, record: &PairRecord) -> Result<()> {
        let bytes = record.to_bytes(PlistFormat::Xml)?;
        self.usbmux
            .save_pair_record(&self.udid, self.handle, &bytes)
            .await
    }

    pub async fn delete(&self) -> Result<()> {
        self.usbmux.delete_pair_record(&self.udid).await
    }
}
