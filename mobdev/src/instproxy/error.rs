//! Installation proxy error codes.

use std::fmt;

use crate::session::StartServiceError;

/// Installation proxy result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum InstProxyCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Message could not be encoded or decoded.
    PlistError = -2,
    /// Connection to the service failed or was closed.
    ConnFailed = -3,
    /// Another command is still running.
    OpInProgress = -4,
    /// Command failed for an unlisted reason.
    OpFailed = -5,
    /// No reply within the receive timeout.
    ReceiveTimeout = -6,
    /// App is already archived.
    AlreadyArchived = -7,
    /// Internal installd error.
    ApiInternalError = -8,
    /// App is already installed.
    ApplicationAlreadyInstalled = -9,
    /// App could not be moved.
    ApplicationMoveFailed = -10,
    /// SINF could not be captured.
    ApplicationSinfCaptureFailed = -11,
    /// Sandbox setup failed.
    ApplicationSandboxFailed = -12,
    /// App signature verification failed.
    ApplicationVerificationFailed = -13,
    /// Archive could not be removed.
    ArchiveDestructionFailed = -14,
    /// Bundle verification failed.
    BundleVerificationFailed = -15,
    /// Carrier bundle copy failed.
    CarrierBundleCopyFailed = -16,
    /// Carrier bundle directory could not be created.
    CarrierBundleDirectoryCreationFailed = -17,
    /// Carrier bundle lists no supported SIMs.
    CarrierBundleMissingSupportedSims = -18,
    /// CommCenter notification failed.
    CommCenterNotificationFailed = -19,
    /// Container could not be created.
    ContainerCreationFailed = -20,
    /// Container ownership change failed.
    ContainerP0wnFailed = -21,
    /// Container could not be removed.
    ContainerRemovalFailed = -22,
    /// Embedded provisioning profile install failed.
    EmbeddedProfileInstallFailed = -23,
    /// Executable patching failed.
    ExecutableTwiddleFailed = -24,
    /// Existence check failed.
    ExistenceCheckFailed = -25,
    /// Install map update failed.
    InstallMapUpdateFailed = -26,
    /// Manifest capture failed.
    ManifestCaptureFailed = -27,
    /// Map generation failed.
    MapGenerationFailed = -28,
    /// Bundle has no executable.
    MissingBundleExecutable = -29,
    /// Bundle has no identifier.
    MissingBundleIdentifier = -30,
    /// Bundle path missing.
    MissingBundlePath = -31,
    /// Container missing.
    MissingContainer = -32,
    /// Notification failed.
    NotificationFailed = -33,
    /// Package extraction failed.
    PackageExtractionFailed = -34,
    /// Package inspection failed.
    PackageInspectionFailed = -35,
    /// Package move failed.
    PackageMoveFailed = -36,
    /// Path conversion failed.
    PathConversionFailed = -37,
    /// Container restore failed.
    RestoreContainerFailed = -38,
    /// Seatbelt profile removal failed.
    SeatbeltProfileRemovalFailed = -39,
    /// Staging area could not be created.
    StageCreationFailed = -40,
    /// Symlink creation failed.
    SymlinkFailed = -41,
    /// Command not recognized.
    UnknownCommand = -42,
    /// iTunes artwork capture failed.
    ItunesArtworkCaptureFailed = -43,
    /// iTunes metadata capture failed.
    ItunesMetadataCaptureFailed = -44,
    /// Device OS is older than the app requires.
    DeviceOsVersionTooLow = -45,
    /// Device family not supported by the app.
    DeviceFamilyNotSupported = -46,
    /// Package patch failed.
    PackagePatchFailed = -47,
    /// Binary built for another architecture.
    IncorrectArchitecture = -48,
    /// Plugin copy failed.
    PluginCopyFailed = -49,
    /// Breadcrumb write failed.
    BreadcrumbFailed = -50,
    /// Breadcrumb unlock failed.
    BreadcrumbUnlockFailed = -51,
    /// GeoJSON capture failed.
    GeoJsonCaptureFailed = -52,
    /// Newsstand artwork capture failed.
    NewsstandArtworkCaptureFailed = -53,
    /// Request had no command.
    MissingCommand = -54,
    /// Caller lacks the entitlement.
    NotEntitled = -55,
    /// Request had no package path.
    MissingPackagePath = -56,
    /// Request had no container path.
    MissingContainerPath = -57,
    /// Request had no app identifier.
    MissingApplicationIdentifier = -58,
    /// Attribute value missing.
    MissingAttributeValue = -59,
    /// Lookup failed.
    LookupFailed = -60,
    /// Dictionary creation failed.
    DictCreationFailed = -61,
    /// Installs are restricted.
    InstallProhibited = -62,
    /// Uninstalls are restricted.
    UninstallProhibited = -63,
    /// Bundle has no version.
    MissingBundleVersion = -64,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Device error names and the codes they map to.
const DEVICE_ERRORS: &[(&str, InstProxyCode)] = &[
    ("AlreadyArchived", InstProxyCode::AlreadyArchived),
    ("APIInternalError", InstProxyCode::ApiInternalError),
    ("ApplicationAlreadyInstalled", InstProxyCode::ApplicationAlreadyInstalled),
    ("ApplicationMoveFailed", InstProxyCode::ApplicationMoveFailed),
    ("ApplicationSINFCaptureFailed", InstProxyCode::ApplicationSinfCaptureFailed),
    ("ApplicationSandboxFailed", InstProxyCode::ApplicationSandboxFailed),
    ("ApplicationVerificationFailed", InstProxyCode::ApplicationVerificationFailed),
    ("ArchiveDestructionFailed", InstProxyCode::ArchiveDestructionFailed),
    ("BundleVerificationFailed", InstProxyCode::BundleVerificationFailed),
    ("CarrierBundleCopyFailed", InstProxyCode::CarrierBundleCopyFailed),
    (
        "CarrierBundleDirectoryCreationFailed",
        InstProxyCode::CarrierBundleDirectoryCreationFailed,
    ),
    (
        "CarrierBundleMissingSupportedSIMs",
        InstProxyCode::CarrierBundleMissingSupportedSims,
    ),
    ("CommCenterNotificationFailed", InstProxyCode::CommCenterNotificationFailed),
    ("ContainerCreationFailed", InstProxyCode::ContainerCreationFailed),
    ("ContainerP0wnFailed", InstProxyCode::ContainerP0wnFailed),
    ("ContainerRemovalFailed", InstProxyCode::ContainerRemovalFailed),
    ("EmbeddedProfileInstallFailed", InstProxyCode::EmbeddedProfileInstallFailed),
    ("ExecutableTwiddleFailed", InstProxyCode::ExecutableTwiddleFailed),
    ("ExistenceCheckFailed", InstProxyCode::ExistenceCheckFailed),
    ("InstallMapUpdateFailed", InstProxyCode::InstallMapUpdateFailed),
    ("ManifestCaptureFailed", InstProxyCode::ManifestCaptureFailed),
    ("MapGenerationFailed", InstProxyCode::MapGenerationFailed),
    ("MissingBundleExecutable", InstProxyCode::MissingBundleExecutable),
    ("MissingBundleIdentifier", InstProxyCode::MissingBundleIdentifier),
    ("MissingBundlePath", InstProxyCode::MissingBundlePath),
    ("MissingContainer", InstProxyCode::MissingContainer),
    ("NotificationFailed", InstProxyCode::NotificationFailed),
    ("PackageExtractionFailed", InstProxyCode::PackageExtractionFailed),
    ("PackageInspectionFailed", InstProxyCode::PackageInspectionFailed),
    ("PackageMoveFailed", InstProxyCode::PackageMoveFailed),
    ("PathConversionFailed", InstProxyCode::PathConversionFailed),
    ("RestoreContainerFailed", InstProxyCode::RestoreContainerFailed),
    ("SeatbeltProfileRemovalFailed", InstProxyCode::SeatbeltProfileRemovalFailed),
    ("StageCreationFailed", InstProxyCode::StageCreationFailed),
    ("SymlinkFailed", InstProxyCode::SymlinkFailed),
    ("UnknownCommand", InstProxyCode::UnknownCommand),
    ("iTunesArtworkCaptureFailed", InstProxyCode::ItunesArtworkCaptureFailed),
    ("iTunesMetadataCaptureFailed", InstProxyCode::ItunesMetadataCaptureFailed),
    ("DeviceOSVersionTooLow", InstProxyCode::DeviceOsVersionTooLow),
    ("DeviceFamilyNotSupported", InstProxyCode::DeviceFamilyNotSupported),
    ("PackagePatchFailed", InstProxyCode::PackagePatchFailed),
    ("IncorrectArchitecture", InstProxyCode::IncorrectArchitecture),
    ("PluginCopyFailed", InstProxyCode::PluginCopyFailed),
    ("BreadcrumbFailed", InstProxyCode::BreadcrumbFailed),
    ("BreadcrumbUnlockFailed", InstProxyCode::BreadcrumbUnlockFailed),
    ("GeoJSONCaptureFailed", InstProxyCode::GeoJsonCaptureFailed),
    ("NewsstandArtworkCaptureFailed", InstProxyCode::NewsstandArtworkCaptureFailed),
    ("MissingCommand", InstProxyCode::MissingCommand),
    ("NotEntitled", InstProxyCode::NotEntitled),
    ("MissingPackagePath", InstProxyCode::MissingPackagePath),
    ("MissingContainerPath", InstProxyCode::MissingContainerPath),
    ("MissingApplicationIdentifier", InstProxyCode::MissingApplicationIdentifier),
    ("MissingAttributeValue", InstProxyCode::MissingAttributeValue),
    ("LookupFailed", InstProxyCode::LookupFailed),
    ("DictCreationFailed", InstProxyCode::DictCreationFailed),
    ("InstallProhibited", InstProxyCode::InstallProhibited),
    ("UninstallProhibited", InstProxyCode::UninstallProhibited),
    ("MissingBundleVersion", InstProxyCode::MissingBundleVersion),
];

impl InstProxyCode {
    /// Maps a device error name; unknown names become [`InstProxyCode::OpFailed`].
    pub fn from_device_name(name: &str) -> Self {
        DEVICE_ERRORS
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(Self::OpFailed, |(_, code)| *code)
    }

    /// Numeric value.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Failure reported by the device in a status message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct StatusError {
    /// Mapped local code.
    pub code: InstProxyCode,
    /// Raw error name.
    pub name: String,
    /// Human-readable description, when the device sent one.
    pub description: Option<String>,
    /// Device-side numeric detail, when present.
    pub detail: Option<u64>,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        if let Some(detail) = self.detail {
            write!(f, " (0x{detail:x})")?;
        }
        Ok(())
    }
}

/// Errors from installation proxy commands.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InstProxyError {
    /// A caller-supplied argument was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// A message could not be encoded or decoded.
    #[error("malformed message: {0}")]
    Plist(String),

    /// The connection failed or the client was closed.
    #[error("connection failed")]
    ConnFailed(#[source] crate::Error),

    /// Another command is still running on this client.
    #[error("another command is in progress")]
    OpInProgress,

    /// No status arrived within the command timeout.
    #[error("timed out waiting for status")]
    ReceiveTimeout,

    /// A lookup reply lacked an expected attribute.
    #[error("lookup result is missing {0}")]
    MissingAttribute(&'static str),

    /// The device reported a failure.
    #[error("device reported {0}")]
    Device(StatusError),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl InstProxyError {
    /// Numeric code in the installation proxy taxonomy.
    pub const fn code(&self) -> InstProxyCode {
        match self {
            Self::InvalidArg(_) => InstProxyCode::InvalidArg,
            Self::Plist(_) => InstProxyCode::PlistError,
            Self::ConnFailed(_) | Self::Start(_) => InstProxyCode::ConnFailed,
            Self::OpInProgress => InstProxyCode::OpInProgress,
            Self::ReceiveTimeout => InstProxyCode::ReceiveTimeout,
            Self::MissingAttribute(_) => InstProxyCode::OpFailed,
            Self::Device(err) => err.code,
        }
    }
}

impl From<crate::Error> for InstProxyError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Timeout => Self::ReceiveTimeout,
            crate::Error::Malformed(msg) => Self::Plist(msg),
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::ConnFailed(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_map_to_codes() {
        assert_eq!(
            InstProxyCode::from_device_name("ApplicationAlreadyInstalled").code(),
            -9
        );
        assert_eq!(InstProxyCode::from_device_name("MissingBundleVersion").code(), -64);
        assert_eq!(
            InstProxyCode::from_device_name("iTunesMetadataCaptureFailed"),
            InstProxyCode::ItunesMetadataCaptureFailed
        );
    }

    #[test]
    fn unknown_name_is_op_failed() {
        assert_eq!(
            InstProxyCode::from_device_name("SomethingNew"),
            InstProxyCode::OpFailed
        );
    }

    #[test]
    fn status_error_display_keeps_raw_fields() {
        let err = StatusError {
            code: InstProxyCode::OpFailed,
            name: "SomethingNew".into(),
            description: Some("disk on fire".into()),
            detail: Some(0xe800_0067),
        };
        assert_eq!(err.to_string(), "SomethingNew: disk on fire (0xe8000067)");
    }
}
