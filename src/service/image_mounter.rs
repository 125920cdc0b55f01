//! `com.apple.mobile.mobile_image_mounter`, uploads and mounts disk images
//! such as the developer image

use plist::{Dictionary, Value};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

/// Where images are staged before mounting, ignored by iOS 7 and later
pub const DEFAULT_IMAGE_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimage";

const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageMounterError {
    #[error("the device is locked")]
    DeviceLocked,
    #[error("{error}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    CommandFailed {
        error: String,
        detail: Option<String>,
    },
    #[error("unexpected status `{0}`")]
    UnexpectedStatus(String),
}

impl ImageMounterError {
    fn from_reply(reply: &Dictionary) -> Option<Self> {
        let error = reply.get("Error").and_then(Value::as_string)?;

        if error == "DeviceLocked" {
            return Some(Self::DeviceLocked);
        }

        Some(Self::CommandFailed {
            error: error.to_string(),
            detail: reply
                .get("DetailedError")
                .and_then(Value::as_string)
                .map(str::to_string),
        })
    }
}

#[derive(Debug)]
pub struct ImageMounterClient {
    channel: Channel,
}

impl LockdownService for ImageMounterClient {
    const SERVICE_NAME: &'static str = "com.apple.mobile.mobile_image_mounter";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl ImageMounterClient {
    async fn command(&mut self, command: &str, mut fields: Dictionary) -> Result<Dictionary> {
        fields.insert("Command".into(), command.into());
        tracing::debug!(command, "image mounter request");

        let reply: Dictionary = self.channel.request(&fields).await?;
        Self::check(&reply)?;
        Ok(reply)
    }

    fn check(reply: &Dictionary) -> Result<()> {
        match ImageMounterError::from_reply(reply) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn expect_status(reply: &Dictionary, expected: &str) -> Result<()> {
        match reply.get("Status").and_then(Value::as_string) {
            Some(status) if status == expected => Ok(()),
            Some(status) => Err(ImageMounterError::UnexpectedStatus(status.to_string()).into()),
            None => Err(Error::MissingField("Status")),
        }
    }

    /// Signatures of mounted images of `image_type`, e.g. `Developer`
    pub async fn lookup(&mut self, image_type: &str) -> Result<Dictionary> {
        let mut fields = Dictionary::new();
        fields.insert("ImageType".into(), image_type.into());

        self.command("LookupImage", fields).await
    }

    /// Streams `size` bytes of `image` to the device
    pub async fn upload(
        &mut self,
        image_type: &str,
        image: &mut (impl AsyncRead + Unpin),
        size: u64,
        signature: &[u8],
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("ImageType".into(), image_type.into());
        fields.insert("ImageSize".into(), size.into());
        fields.insert("ImageSignature".into(), Value::Data(signature.to_vec()));

        let reply = self.command("ReceiveBytes", fields).await?;
        Self::expect_status(&reply, "ReceiveBytesAck")?;

        let mut remaining = size;
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        while remaining > 0 {
            let want = remaining.min(UPLOAD_CHUNK as u64) as usize;
            let n = image.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(Error::unexpected(format!(
                    "image ended {remaining} bytes early"
                )));
            }

            self.channel.send(&buf[..n]).await?;
            remaining -= n as u64;
        }
        tracing::debug!(size, "image uploaded");

        let reply: Dictionary = self.channel.recv_plist().await?;
        Self::check(&reply)?;
        Self::expect_status(&reply, "Complete")
    }

    /// Mounts the uploaded image
    pub async fn mount(
        &mut self,
        image_type: &str,
        image_path: Option<&str>,
        signature: &[u8],
    ) -> Result<Dictionary> {
        let mut fields = Dictionary::new();
        fields.insert("ImageType".into(), image_type.into());
        fields.insert(
            "ImagePath".into(),
            image_path.unwrap_or(DEFAULT_IMAGE_PATH).into(),
        );
        fields.insert("ImageSignature".into(), Value::Data(signature.to_vec()));

        let reply = self.command("MountImage", fields).await?;
        tracing::info!(image_type, "image mounted");
        Ok(reply)
    }

    /// Ends the conversation, the device closes the connection afterwards
    pub async fn hangup(&mut self) -> Result<()> {
        self.command("Hangup", Dictionary::new()).await?;
        self.channel.close().await
    }
}
