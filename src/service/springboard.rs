//! `com.apple.springboardservices`: icons, wallpaper and home screen layout

use plist::{Dictionary, Value};

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceOrientation {
    Unknown,
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl InterfaceOrientation {
    #[must_use]
    pub const fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Portrait,
            2 => Self::PortraitUpsideDown,
            3 => Self::LandscapeRight,
            4 => Self::LandscapeLeft,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug)]
pub struct SpringboardClient {
    channel: Channel,
}

impl LockdownService for SpringboardClient {
    const SERVICE_NAME: &'static str = "com.apple.springboardservices";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl SpringboardClient {
    async fn command<R: serde::de::DeserializeOwned>(
        &mut self,
        command: &str,
        mut fields: Dictionary,
    ) -> Result<R> {
        fields.insert("command".into(), command.into());
        tracing::debug!(command, "springboard request");

        self.channel.request(&fields).await
    }

    async fn png(&mut self, command: &str, fields: Dictionary) -> Result<Vec<u8>> {
        let mut reply: Dictionary = self.command(command, fields).await?;

        match reply.remove("pngData") {
            Some(Value::Data(png)) => Ok(png),
            _ => Err(Error::MissingField("pngData")),
        }
    }

    /// PNG of the home screen icon for `bundle_id`
    pub async fn icon_png(&mut self, bundle_id: &str) -> Result<Vec<u8>> {
        let mut fields = Dictionary::new();
        fields.insert("bundleId".into(), bundle_id.into());

        self.png("getIconPNGData", fields).await
    }

    pub async fn wallpaper_png(&mut self) -> Result<Vec<u8>> {
        self.png("getHomeScreenWallpaperPNGData", Dictionary::new())
            .await
    }

    pub async fn interface_orientation(&mut self) -> Result<InterfaceOrientation> {
        let reply: Dictionary = self
            .command("getInterfaceOrientation", Dictionary::new())
            .await?;

        reply
            .get("interfaceOrientation")
            .and_then(Value::as_unsigned_integer)
            .map(InterfaceOrientation::from_code)
            .ok_or(Error::MissingField("interfaceOrientation"))
    }

    /// The home screen layout, pages of icon dictionaries
    pub async fn icon_state(&mut self) -> Result<Value> {
        let mut fields = Dictionary::new();
        fields.insert("formatVersion".into(), "2".into());

        self.command("getIconState", fields).await
    }

    /// Replaces the home screen layout. The device sends no reply.
    pub async fn set_icon_state(&mut self, state: Value) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("command".into(), "setIconState".into());
        fields.insert("iconState".into(), state);

        self.channel.send_plist(&fields).await
    }
}
