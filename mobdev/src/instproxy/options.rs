//! Typed `ClientOptions` dictionary.

use mobdev_proto::message::string_array;
use plist::{Dictionary, Value};

/// Application classes accepted by `Browse` and `Lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ApplicationType {
    /// Built-in apps.
    System,
    /// Installed apps.
    User,
    /// Both.
    Any,
    /// Internal apps.
    Internal,
}

impl ApplicationType {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Any => "Any",
            Self::Internal => "Internal",
        }
    }
}

/// Options attached to every command.
///
/// ```
/// use mobdev::instproxy::{ApplicationType, ClientOptions};
///
/// let opts = ClientOptions::new()
///     .application_type(ApplicationType::User)
///     .return_attributes(["CFBundleIdentifier", "Path"]);
/// assert_eq!(opts.as_dict().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct ClientOptions(Dictionary);

impl ClientOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `ApplicationType`.
    pub fn application_type(self, kind: ApplicationType) -> Self {
        self.custom("ApplicationType", kind.as_str())
    }

    /// Sets `SkipUninstall`.
    pub fn skip_uninstall(self, skip: bool) -> Self {
        self.custom("SkipUninstall", skip)
    }

    /// Sets `ApplicationSINF`.
    pub fn application_sinf(self, sinf: Vec<u8>) -> Self {
        self.custom("ApplicationSINF", Value::Data(sinf))
    }

    /// Sets `iTunesMetadata`.
    pub fn itunes_metadata(self, metadata: Vec<u8>) -> Self {
        self.custom("iTunesMetadata", Value::Data(metadata))
    }

    /// Sets `ArchiveType`, e.g. `ApplicationOnly`.
    pub fn archive_type(self, kind: &str) -> Self {
        self.custom("ArchiveType", kind)
    }

    /// Limits the attributes returned per app.
    pub fn return_attributes<I, S>(self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom("ReturnAttributes", string_array(attributes))
    }

    /// Limits a lookup to the given bundle identifiers.
    pub fn bundle_ids<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom("BundleIDs", string_array(ids))
    }

    /// Sets an arbitrary key.
    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    /// Borrows the dictionary.
    pub const fn as_dict(&self) -> &Dictionary {
        &self.0
    }

    /// Whether any option is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
