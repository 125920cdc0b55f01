//! `com.apple.mobile.installation_proxy`
//!
//! Every command is answered by a stream of status messages. Intermediate
//! messages carry a `Status` name and usually a `PercentComplete`; the stream
//! ends with `Status == "Complete"` or a message carrying an `Error`.

use std::fmt;

use plist::{Dictionary, Value};
use tokio::sync::mpsc;

use crate::{
    channel::Channel,
    error::{Error, Result},
    service::LockdownService,
};

macro_rules! install_errors {
    ($($variant:ident => $name:literal,)*) => {
        /// Error names reported by the installation proxy
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum InstallError {
            $($variant,)*
            Unknown(String),
        }

        impl InstallError {
            #[must_use]
            pub fn from_name(name: &str) -> Self {
                match name {
                    $($name => Self::$variant,)*
                    other => Self::Unknown(other.to_string()),
                }
            }

            #[must_use]
            pub fn name(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::Unknown(name) => name.as_str(),
                }
            }
        }

        impl fmt::Display for InstallError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl std::error::Error for InstallError {}
    };
}

install_errors! {
    AlreadyArchived => "AlreadyArchived",
    ApiInternalError => "APIInternalError",
    ApplicationAlreadyInstalled => "ApplicationAlreadyInstalled",
    ApplicationMoveFailed => "ApplicationMoveFailed",
    ApplicationSinfCaptureFailed => "ApplicationSINFCaptureFailed",
    ApplicationSandboxFailed => "ApplicationSandboxFailed",
    ApplicationVerificationFailed => "ApplicationVerificationFailed",
    ArchiveDestructionFailed => "ArchiveDestructionFailed",
    BundleVerificationFailed => "BundleVerificationFailed",
    CarrierBundleCopyFailed => "CarrierBundleCopyFailed",
    CarrierBundleDirectoryCreationFailed => "CarrierBundleDirectoryCreationFailed",
    CarrierBundleMissingSupportedSims => "CarrierBundleMissingSupportedSIMs",
    CommCenterNotificationFailed => "CommCenterNotificationFailed",
    ContainerCreationFailed => "ContainerCreationFailed",
    ContainerP0wnFailed => "ContainerP0wnFailed",
    ContainerRemovalFailed => "ContainerRemovalFailed",
    EmbeddedProfileInstallFailed => "EmbeddedProfileInstallFailed",
    ExecutableTwiddleFailed => "ExecutableTwiddleFailed",
    ExistenceCheckFailed => "ExistenceCheckFailed",
    InstallMapUpdateFailed => "InstallMapUpdateFailed",
    ManifestCaptureFailed => "ManifestCaptureFailed",
    MapGenerationFailed => "MapGenerationFailed",
    MissingBundleExecutable => "MissingBundleExecutable",
    MissingBundleIdentifier => "MissingBundleIdentifier",
    MissingBundlePath => "MissingBundlePath",
    MissingContainer => "MissingContainer",
    NotificationFailed => "NotificationFailed",
    PackageExtractionFailed => "PackageExtractionFailed",
    PackageInspectionFailed => "PackageInspectionFailed",
    PackageMoveFailed => "PackageMoveFailed",
    PathConversionFailed => "PathConversionFailed",
    RestoreContainerFailed => "RestoreContainerFailed",
    SeatbeltProfileRemovalFailed => "SeatbeltProfileRemovalFailed",
    StageCreationFailed => "StageCreationFailed",
    SymlinkFailed => "SymlinkFailed",
    UnknownCommand => "UnknownCommand",
    ItunesArtworkCaptureFailed => "iTunesArtworkCaptureFailed",
    ItunesMetadataCaptureFailed => "iTunesMetadataCaptureFailed",
    DeviceOsVersionTooLow => "DeviceOSVersionTooLow",
    DeviceFamilyNotSupported => "DeviceFamilyNotSupported",
    PackagePatchFailed => "PackagePatchFailed",
    IncorrectArchitecture => "IncorrectArchitecture",
    PluginCopyFailed => "PluginCopyFailed",
    BreadcrumbFailed => "BreadcrumbFailed",
    BreadcrumbUnlockFailed => "BreadcrumbUnlockFailed",
    GeoJsonCaptureFailed => "GeoJSONCaptureFailed",
    NewsstandArtworkCaptureFailed => "NewsstandArtworkCaptureFailed",
    MissingCommand => "MissingCommand",
    NotEntitled => "NotEntitled",
    MissingPackagePath => "MissingPackagePath",
    MissingContainerPath => "MissingContainerPath",
    MissingApplicationIdentifier => "MissingApplicationIdentifier",
    MissingAttributeValue => "MissingAttributeValue",
    LookupFailed => "LookupFailed",
    DictCreationFailed => "DictCreationFailed",
    InstallProhibited => "InstallProhibited",
    UninstallProhibited => "UninstallProhibited",
    MissingBundleVersion => "MissingBundleVersion",
}

/// The terminal failure of a command, as described by the device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} ({code:#x}){}", .details.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct InstallStatusError {
    pub kind: InstallError,
    pub name: String,
    pub details: Option<String>,
    pub code: u64,
}

impl InstallStatusError {
    /// Extracts the failure from a status message, `None` when it reports none
    #[must_use]
    pub fn from_status(status: &Dictionary) -> Option<Self> {
        let name = status.get("Error").and_then(Value::as_string)?;

        Some(Self {
            kind: InstallError::from_name(name),
            name: name.to_string(),
            details: status
                .get("ErrorDescription")
                .and_then(Value::as_string)
                .map(str::to_string),
            code: status
                .get("ErrorDetail")
                .and_then(Value::as_unsigned_integer)
                .unwrap_or_default(),
        })
    }
}

/// One intermediate status of a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallProgress {
    /// status name, e.g. `CopyingApplication` or `VerifyingApplication`
    pub status: String,
    /// percent in `0..=100`, never lower than a previously reported one
    pub percent: Option<u8>,
}

/// Progress callback that forwards into `tx`, dropping updates once the
/// receiver is gone
pub fn forward_to(tx: mpsc::UnboundedSender<InstallProgress>) -> impl FnMut(InstallProgress) {
    move |progress| {
        let _ = tx.send(progress);
    }
}

/// `ClientOptions` of a command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallOptions {
    pub skip_uninstall: Option<bool>,
    pub application_sinf: Option<Vec<u8>>,
    pub itunes_metadata: Option<Vec<u8>>,
    pub return_attributes: Option<Vec<String>>,
    pub bundle_ids: Option<Vec<String>>,
    /// e.g. `ApplicationType: User`
    pub additional: Dictionary,
}

impl InstallOptions {
    #[must_use]
    pub fn to_dictionary(&self) -> Dictionary {
        let mut options = self.additional.clone();

        if let Some(skip) = self.skip_uninstall {
            options.insert("SkipUninstall".into(), skip.into());
        }
        if let Some(sinf) = &self.application_sinf {
            options.insert("ApplicationSINF".into(), Value::Data(sinf.clone()));
        }
        if let Some(metadata) = &self.itunes_metadata {
            options.insert("iTunesMetadata".into(), Value::Data(metadata.clone()));
        }
        if let Some(attributes) = &self.return_attributes {
            options.insert("ReturnAttributes".into(), strings(attributes));
        }
        if let Some(ids) = &self.bundle_ids {
            options.insert("BundleIDs".into(), strings(ids));
        }

        options
    }
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

/// Keeps reported percentages monotonic
#[derive(Debug, Default)]
struct ProgressTracker {
    highest: Option<u8>,
}

impl ProgressTracker {
    fn track(&mut self, status: &Dictionary) -> Option<InstallProgress> {
        let name = status.get("Status").and_then(Value::as_string)?;

        let percent = status
            .get("PercentComplete")
            .and_then(Value::as_unsigned_integer)
            .map(|p| p.min(100) as u8)
            .map(|p| self.highest.map_or(p, |h| h.max(p)));

        if percent.is_some() {
            self.highest = percent;
        }

        Some(InstallProgress {
            status: name.to_string(),
            percent: percent.or(self.highest),
        })
    }
}

#[derive(Debug)]
pub struct InstallationProxyClient {
    channel: Channel,
}

impl LockdownService for InstallationProxyClient {
    const SERVICE_NAME: &'static str = "com.apple.mobile.installation_proxy";

    fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }
}

impl InstallationProxyClient {
    #[must_use]
    pub fn into_channel(self) -> Channel {
        self.channel
    }

    /// Sends `command` and consumes status messages until the terminal one.
    /// Every non-terminal message is handed to `on_status` first.
    async fn run(
        &mut self,
        command: &str,
        mut fields: Dictionary,
        mut on_status: impl FnMut(&Dictionary),
    ) -> Result<Dictionary> {
        fields.insert("Command".into(), command.into());
        tracing::debug!(command, "installation proxy request");
        self.channel.send_plist(&fields).await?;

        loop {
            let status: Dictionary = self.channel.recv_plist().await?;

            if let Some(err) = InstallStatusError::from_status(&status) {
                tracing::debug!(command, error = %err, "installation proxy command failed");
                return Err(err.into());
            }

            if status.get("Status").and_then(Value::as_string) == Some("Complete") {
                tracing::debug!(command, "installation proxy command complete");
                return Ok(status);
            }

            on_status(&status);
        }
    }

    async fn run_with_progress(
        &mut self,
        command: &str,
        fields: Dictionary,
        mut on_progress: impl FnMut(InstallProgress),
    ) -> Result<()> {
        let mut tracker = ProgressTracker::default();

        self.run(command, fields, |status| {
            if let Some(progress) = tracker.track(status) {
                on_progress(progress);
            }
        })
        .await?;

        Ok(())
    }

    /// Installs the package already uploaded to `package_path` on the device
    pub async fn install(
        &mut self,
        package_path: &str,
        options: &InstallOptions,
        on_progress: impl FnMut(InstallProgress),
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("PackagePath".into(), package_path.into());
        fields.insert("ClientOptions".into(), options.to_dictionary().into());

        self.run_with_progress("Install", fields, on_progress).await
    }

    /// Like [`Self::install`] but keeps the existing app's data
    pub async fn upgrade(
        &mut self,
        package_path: &str,
        options: &InstallOptions,
        on_progress: impl FnMut(InstallProgress),
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("PackagePath".into(), package_path.into());
        fields.insert("ClientOptions".into(), options.to_dictionary().into());

        self.run_with_progress("Upgrade", fields, on_progress).await
    }

    pub async fn uninstall(
        &mut self,
        bundle_id: &str,
        options: &InstallOptions,
        on_progress: impl FnMut(InstallProgress),
    ) -> Result<()> {
        let mut fields = Dictionary::new();
        fields.insert("ApplicationIdentifier".into(), bundle_id.into());
        fields.insert("ClientOptions".into(), options.to_dictionary().into());

        self.run_with_progress("Uninstall", fields, on_progress).await
    }

    /// Every installed app matching `options`, gathered from all `CurrentList`
    /// batches
    pub async fn browse(&mut self, options: &InstallOptions) -> Result<Vec<Dictionary>> {
        let mut fields = Dictionary::new();
        fields.insert("ClientOptions".into(), options.to_dictionary().into());

        let mut apps = Vec::new();
        let last = self
            .run("Browse", fields, |status| collect_apps(status, &mut apps))
            .await?;
        collect_apps(&last, &mut apps);

        Ok(apps)
    }

    /// Info for the apps named by `options.bundle_ids`, keyed by bundle id
    pub async fn lookup(&mut self, options: &InstallOptions) -> Result<Dictionary> {
        let mut fields = Dictionary::new();
        fields.insert("ClientOptions".into(), options.to_dictionary().into());

        let mut result = None;
        let last = self
            .run("Lookup", fields, |status| {
                if let Some(found) = status.get("LookupResult").and_then(Value::as_dictionary) {
                    result = Some(found.clone());
                }
            })
            .await?;

        result
            .or_else(|| {
                last.get("LookupResult")
                    .and_then(Value::as_dictionary)
                    .cloned()
            })
            .ok_or(Error::MissingField("LookupResult"))
    }
}

fn collect_apps(status: &Dictionary, apps: &mut Vec<Dictionary>) {
    if let Some(list) = status.get("CurrentList").and_then(Value::as_array) {
        apps.extend(list.iter().filter_map(Value::as_dictionary).cloned());
    }
}
