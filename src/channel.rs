//! Byte stream to one port of one device
//!
//! A [`Channel`] is what usbmuxd hands back after a successful `Connect`: from
//! then on the socket is a plain pipe to the device port. Every higher level
//! client (lockdown, AFC, installation proxy, ...) owns exactly one channel
//! and talks through it with `&mut self`, so requests on a channel can never
//! interleave.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    ReadWrite,
    codec::PlistFormat,
    config::ClientConfig,
    error::{Error, Result},
    lockdown::PairRecord,
    parser::service,
    tls::{self, TlsStream},
};

enum Transport {
    Plain(Box<dyn ReadWrite>),
    Tls(Box<TlsStream>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Exclusively owned stream to a device port, dropping it closes the socket
pub struct Channel {
    transport: Option<Transport>,
    timeout: Option<Duration>,
    plist_format: PlistFormat,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}

/// Raw access for packet codecs that read straight off the stream
impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport).poll_read(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport).poll_flush(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("open", &self.transport.is_some())
            .field("tls", &self.is_tls())
            .field("timeout", &self.timeout)
            .field("plist_format", &self.plist_format)
            .finish()
    }
}

impl Channel {
    /// Wraps an already connected stream
    pub fn new(stream: impl ReadWrite + 'static) -> Self {
        Self {
            transport: Some(Transport::Plain(Box::new(stream))),
            timeout: None,
            plist_format: PlistFormat::Binary,
        }
    }

    /// Wraps a stream and applies the timeout and plist format of `config`
    pub fn with_config(stream: impl ReadWrite + 'static, config: &ClientConfig) -> Self {
        Self {
            timeout: config.timeout,
            plist_format: config.plist_format,
            ..Self::new(stream)
        }
    }

    /// Receive timeout applied to every read, `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_plist_format(&mut self, plist_format: PlistFormat) {
        self.plist_format = plist_format;
    }

    #[must_use]
    pub const fn plist_format(&self) -> PlistFormat {
        self.plist_format
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    /// Runs `fut` under `timeout`, mapping expiry to [`Error::Timeout`]
    pub(crate) async fn timed<T>(
        timeout: Option<Duration>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => fut.await,
        }
    }

    /// Writes all of `data`
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let transport = self.transport()?;

        transport.write_all(data).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Reads whatever is available, up to `max` bytes. An empty result means
    /// the peer closed the stream.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        self.recv_with(max, timeout).await
    }

    /// Like [`Self::recv`] with an explicit timeout for this read only
    pub async fn recv_timeout(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.recv_with(max, Some(timeout)).await
    }

    async fn recv_with(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let transport = self.transport()?;
        let mut buf = vec![0u8; max];

        let n = Self::timed(timeout, async {
            Ok::<_, Error>(transport.read(&mut buf).await?)
        })
        .await?;

        buf.truncate(n);
        Ok(buf)
    }

    /// Reads exactly `len` bytes
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let transport = self.transport()?;
        let mut buf = vec![0u8; len];

        Self::timed(timeout, async {
            transport.read_exact(&mut buf).await?;
            Ok::<_, Error>(())
        })
        .await?;

        Ok(buf)
    }

    /// Sends `value` as a length prefixed plist frame
    pub async fn send_plist<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let format = self.plist_format;
        let frame = service::encode_frame(value, format)?;

        tracing::debug!(len = frame.len(), ?format, "sending plist frame");
        self.send(&frame).await
    }

    /// Receives one length prefixed plist frame
    pub async fn recv_plist<T: DeserializeOwned>(&mut self) -> Result<T> {
        let timeout = self.timeout;
        self.recv_plist_with(timeout).await
    }

    /// Like [`Self::recv_plist`] with an explicit timeout for this read only.
    ///
    /// A timeout before the first byte of a frame leaves the channel usable.
    /// Once a frame has started, a timeout would leave the rest of it queued
    /// on the stream, so the channel is closed instead and later calls fail
    /// with [`Error::NotConnected`].
    pub async fn recv_plist_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<T> {
        self.recv_plist_with(Some(timeout)).await
    }

    async fn recv_plist_with<T: DeserializeOwned>(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let transport = self.transport()?;

        // nothing is consumed until the first byte shows up
        let mut first = [0u8; 1];
        Self::timed(timeout, async {
            transport.read_exact(&mut first).await?;
            Ok::<_, Error>(())
        })
        .await?;

        let mut rest = first.as_slice().chain(&mut *transport);
        let body = match Self::timed(timeout, service::read_frame_bytes(&mut rest)).await {
            Err(e @ Error::Timeout(_)) => {
                tracing::debug!("plist frame cut off by the timeout, closing the channel");
                self.transport = None;
                return Err(e);
            }
            other => other?,
        };
        tracing::debug!(len = body.len(), "received plist frame");

        crate::codec::read_document(&body)
    }

    /// Sends `request` and waits for the reply frame
    pub async fn request<T: Serialize + ?Sized, R: DeserializeOwned>(
        &mut self,
        request: &T,
    ) -> Result<R> {
        self.send_plist(request).await?;
        self.recv_plist().await
    }

    /// Upgrades the stream in place to TLS using the host identity in `record`.
    ///
    /// A record without a usable host identity fails before anything is sent
    /// and leaves the channel as it was. A failed handshake closes it.
    pub async fn enable_tls(&mut self, record: &PairRecord) -> Result<()> {
        let config = match &self.transport {
            Some(Transport::Plain(_)) => tls::client_config(record)?,
            Some(Transport::Tls(_)) => return Ok(()),
            None => return Err(Error::NotConnected),
        };

        match self.transport.take() {
            Some(Transport::Plain(stream)) => {
                let stream = tls::connect(stream, config).await?;
                self.transport = Some(Transport::Tls(Box::new(stream)));
                Ok(())
            }
            other => {
                self.transport = other;
                Ok(())
            }
        }
    }

    /// Drops the TLS layer and continues in plaintext on the same socket
    pub fn disable_tls(&mut self) -> Result<()> {
        match self.transport.take() {
            Some(Transport::Tls(stream)) => {
                let (stream, _) = (*stream).into_inner();
                self.transport = Some(Transport::Plain(stream));
                Ok(())
            }
            Some(plain) => {
                self.transport = Some(plain);
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    /// Shuts the stream down, later calls fail with [`Error::NotConnected`]
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_plist_exchange() {
        let (a, b) = duplex(4096);
        let mut left = Channel::new(a);
        let mut right = Channel::new(b);
        right.set_plist_format(PlistFormat::Xml);

        let request = plist_macro::plist!({ "Request": "QueryType" });
        left.send_plist(&request).await.unwrap();
        let received: plist::Value = right.recv_plist().await.unwrap();
        assert_eq!(received, request);

        let reply = plist_macro::plist!({ "Type": "com.apple.mobile.lockdown" });
        right.send_plist(&reply).await.unwrap();
        let received: plist::Dictionary = left.recv_plist().await.unwrap();
        assert_eq!(
            received.get("Type").and_then(plist::Value::as_string),
            Some("com.apple.mobile.lockdown")
        );
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (a, _b) = duplex(64);
        let mut channel = Channel::new(a);

        let err = channel
            .recv_timeout(16, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unusable_record_keeps_the_plain_stream() {
        let (a, b) = duplex(64);
        let mut channel = Channel::new(a);
        let mut device = Channel::new(b);

        let err = channel.enable_tls(&PairRecord::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPairRecord(_)));
        assert!(channel.is_open());
        assert!(!channel.is_tls());

        channel.send(b"still plain").await.unwrap();
        assert_eq!(device.recv_exact(11).await.unwrap(), b"still plain");
    }

    #[tokio::test]
    async fn test_timeout_mid_frame_closes_the_channel() {
        let (a, b) = duplex(64);
        let mut channel = Channel::new(a);
        let mut device = Channel::new(b);

        let err = channel
            .recv_plist_timeout::<plist::Value>(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(channel.is_open());

        // a length prefix promising more than ever arrives
        device.send(&[0, 0, 0, 32, b'<']).await.unwrap();

        let err = channel
            .recv_plist_timeout::<plist::Value>(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!channel.is_open());
        assert!(matches!(
            channel.recv_plist::<plist::Value>().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (a, _b) = duplex(64);
        let mut channel = Channel::new(a);

        channel.close().await.unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.send(b"x").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_raw_bytes() {
        let (a, b) = duplex(64);
        let mut left = Channel::new(a);
        let mut right = Channel::new(b);

        left.send(b"+$OK#9a").await.unwrap();
        assert_eq!(right.recv_exact(7).await.unwrap(), b"+$OK#9a");

        drop(left);
        assert!(right.recv(8).await.unwrap().is_empty());
    }
}
