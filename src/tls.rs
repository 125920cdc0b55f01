//! TLS upgrade of device channels using the host identity from a pair record

use std::sync::Arc;

use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio_rustls::TlsConnector;

use crate::{
    ReadWrite,
    error::{Error, Result},
    lockdown::PairRecord,
};

pub type TlsStream = tokio_rustls::client::TlsStream<Box<dyn ReadWrite>>;

/// lockdownd ignores SNI, any syntactically valid name works
const SERVER_NAME: &str = "lockdown";

/// Accepts the device's certificate without a chain check, the device cert is
/// signed by the pair record root which no public store knows about.
/// Handshake signatures are still verified.
#[derive(Debug)]
struct DeviceCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for DeviceCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn host_identity(
    record: &PairRecord,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key_pem = record
        .host_private_key
        .as_deref()
        .ok_or_else(|| Error::InvalidPairRecord("no `HostPrivateKey`".into()))?;

    let certs = rustls_pemfile::certs(&mut record.host_certificate.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidPairRecord(format!("bad `HostCertificate`: {e}")))?;

    if certs.is_empty() {
        return Err(Error::InvalidPairRecord(
            "`HostCertificate` holds no certificate".into(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::InvalidPairRecord(format!("bad `HostPrivateKey`: {e}")))?
        .ok_or_else(|| Error::InvalidPairRecord("`HostPrivateKey` holds no key".into()))?;

    Ok((certs, key))
}

/// Builds a client configuration presenting the pair record's host certificate
pub fn client_config(record: &PairRecord) -> Result<Arc<rustls::ClientConfig>> {
    let (certs, key) = host_identity(record)?;
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeviceCertVerifier { provider }))
        .with_client_auth_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Runs the client handshake over `stream`
pub async fn connect(
    stream: Box<dyn ReadWrite>,
    config: Arc<rustls::ClientConfig>,
) -> Result<TlsStream> {
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from(SERVER_NAME)
        .map_err(|e| Error::unexpected(format!("invalid tls server name: {e}")))?;

    tracing::debug!("starting tls handshake");
    let stream = connector.connect(server_name, stream).await?;
    tracing::debug!("tls handshake complete");

    Ok(stream)
}
