//! GDB remote serial protocol over the debugserver service
//!
//! Packets are `$<data>#<checksum>` with the checksum being the byte sum of
//! `data` modulo 256 as two lowercase hex digits. Until no-ack mode is
//! negotiated every packet is acknowledged with `+`.

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DebugserverError {
    #[error("debugserver replied with error `{0}`")]
    Response(String),
    #[error("packet checksum mismatch, expected {expected:02x} got {actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("the device refused the packet")]
    Nack,
}

/// A command name followed by hex encoded arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugserverCommand {
    name: String,
    arguments: Vec<String>,
}

impl DebugserverCommand {
    pub fn new<I, S>(name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }

    /// Packet body, before framing
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        let mut body = self.name.as_bytes().to_vec();
        for argument in &self.arguments {
            body.extend_from_slice(hex::encode(argument).as_bytes());
        }
        body
    }
}

#[must_use]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Frames `body` as `$body#xx`
#[must_use]
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(b'$');
    packet.extend_from_slice(body);
    packet.push(b'#');
    packet.extend_from_slice(format!("{:02x}", checksum(body)).as_bytes());
    packet
}

#[derive(Debug)]
pub struct DebugserverClient {
    channel: Channel,
    ack: bool,
    buffer: Vec<u8>,
}

impl LockdownService for DebugserverClient {
    const SERVICE_NAME: &'static str = "com.apple.debugserver.DVTSecureSocketProxy";
    const FALLBACK_NAMES: &'static [&'static str] = &["com.apple.debugserver"];

    fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            ack: true,
            buffer: Vec::new(),
        }
    }
}

impl DebugserverClient {
    #[must_use]
    pub const fn ack_enabled(&self) -> bool {
        self.ack
    }

    async fn next_byte(&mut self) -> Result<u8> {
        if self.buffer.is_empty() {
            let chunk = self.channel.recv(READ_CHUNK).await?;
            if chunk.is_empty() {
                return Err(Error::NotConnected);
            }
            // stored reversed so `pop` yields bytes in order
            self.buffer = chunk.into_iter().rev().collect();
        }

        self.buffer.pop().ok_or(Error::NotConnected)
    }

    async fn wait_for_ack(&mut self) -> Result<()> {
        match self.next_byte().await? {
            b'+' => Ok(()),
            b'-' => Err(DebugserverError::Nack.into()),
            other => Err(DebugserverError::MalformedPacket(format!(
                "expected an ack, got {:?}",
                other as char
            ))
            .into()),
        }
    }

    /// Sends a raw packet body and waits for the ack when acks are on
    pub async fn send_packet(&mut self, body: &[u8]) -> Result<()> {
        tracing::debug!(packet = %String::from_utf8_lossy(body), "debugserver send");
        self.channel.send(&frame(body)).await?;

        if self.ack {
            self.wait_for_ack().await?;
        }

        Ok(())
    }

    /// Reads the next packet body, acknowledging it when acks are on
    pub async fn receive_packet(&mut self) -> Result<Vec<u8>> {
        // stray acks and noise before the packet start are skipped
        while self.next_byte().await? != b'$' {}

        let mut body = Vec::new();
        loop {
            match self.next_byte().await? {
                b'#' => break,
                b => body.push(b),
            }
        }

        let digits = [self.next_byte().await?, self.next_byte().await?];
        let expected = hex::decode(digits).map_err(DebugserverError::from)?[0];
        let actual = checksum(&body);

        if expected != actual {
            if self.ack {
                self.channel.send(b"-").await?;
            }
            return Err(DebugserverError::ChecksumMismatch { expected, actual }.into());
        }

        if self.ack {
            self.channel.send(b"+").await?;
        }

        tracing::debug!(packet = %String::from_utf8_lossy(&body), "debugserver receive");
        Ok(body)
    }

    /// Sends `command` and returns the reply body. `E..` replies become
    /// [`DebugserverError::Response`].
    pub async fn send_command(&mut self, command: &DebugserverCommand) -> Result<Vec<u8>> {
        self.send_packet(&command.body()).await?;
        let reply = self.receive_packet().await?;

        if reply.len() == 3 && reply[0] == b'E' {
            return Err(
                DebugserverError::Response(String::from_utf8_lossy(&reply).into_owned()).into(),
            );
        }

        Ok(reply)
    }

    async fn expect_ok(&mut self, command: &DebugserverCommand) -> Result<String> {
        let reply = self.send_command(command).await?;
        let reply = String::from_utf8_lossy(&reply).into_owned();

        if reply == "OK" {
            Ok(reply)
        } else {
            Err(DebugserverError::Response(reply).into())
        }
    }

    /// Toggles packet acknowledgement. Turning it off negotiates
    /// `QStartNoAckMode`; the switch takes effect after the reply.
    pub async fn set_ack_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled && self.ack {
            self.expect_ok(&DebugserverCommand::new("QStartNoAckMode", Vec::<String>::new()))
                .await?;
        }

        self.ack = enabled;
        Ok(())
    }

    /// Sets `key=value` in the environment of the process to be launched
    pub async fn set_environment(&mut self, key: &str, value: &str) -> Result<String> {
        let command =
            DebugserverCommand::new("QEnvironmentHexEncoded:", [format!("{key}={value}")]);
        self.expect_ok(&command).await
    }

    /// Sets the launch arguments with an `A` packet, `executable` is argument 0
    pub async fn launch(&mut self, executable: &str, arguments: &[String]) -> Result<String> {
        let body = launch_body(executable, arguments);

        self.send_packet(&body).await?;
        let reply = String::from_utf8_lossy(&self.receive_packet().await?).into_owned();

        if reply == "OK" {
            Ok(reply)
        } else {
            Err(DebugserverError::Response(reply).into())
        }
    }
}

fn launch_body(executable: &str, arguments: &[String]) -> Vec<u8> {
    let mut body = b"A".to_vec();

    let all = std::iter::once(executable).chain(arguments.iter().map(String::as_str));
    for (index, argument) in all.enumerate() {
        let encoded = hex::encode(argument);
        if index > 0 {
            body.push(b',');
        }
        body.extend_from_slice(format!("{},{},", encoded.len(), index).as_bytes());
        body.extend_from_slice(encoded.as_bytes());
    }

    body
}
