//! Pair records: the host identity a device trusts.
//!
//! Records come from the multiplexer (`ReadPairRecord`) or from disk.
//! Disk lookup tries, in order, `$MOBDEV_LOCKDOWN_DIR`, the platform
//! lockdown directory, then `<platform_data_dir>/mobdev/lockdown`; each
//! record is stored as `<udid>.plist`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::transport::TlsIdentity;
use crate::{Error, Result};

/// Environment variable overriding the pair-record directory.
pub const ENV_LOCKDOWN_DIR: &str = "MOBDEV_LOCKDOWN_DIR";

#[cfg(target_os = "macos")]
const SYSTEM_LOCKDOWN_DIR: &str = "/var/db/lockdown";
#[cfg(not(target_os = "macos"))]
const SYSTEM_LOCKDOWN_DIR: &str = "/var/lib/lockdown";

/// Host pairing material for one device.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[non_exhaustive]
pub struct PairRecord {
    /// PEM host certificate presented during TLS.
    pub host_certificate: plist::Data,
    /// PEM private key for the host certificate.
    pub host_private_key: plist::Data,
    /// PEM certificate of the device.
    #[serde(default)]
    pub device_certificate: Option<plist::Data>,
    /// PEM root certificate.
    #[serde(default)]
    pub root_certificate: Option<plist::Data>,
    /// Host identifier sent with `StartSession`.
    #[serde(rename = "HostID")]
    pub host_id: String,
    /// System BUID sent with `StartSession`.
    #[serde(rename = "SystemBUID", default)]
    pub system_buid: Option<String>,
    /// Escrow bag for services that need the device unlocked.
    #[serde(default)]
    pub escrow_bag: Option<plist::Data>,
    /// Wi-Fi MAC address of the device.
    #[serde(rename = "WiFiMACAddress", default)]
    pub wifi_mac_address: Option<String>,
}

impl fmt::Debug for PairRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairRecord")
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("escrow_bag", &self.escrow_bag.is_some())
            .finish_non_exhaustive()
    }
}

impl PairRecord {
    /// Parses a record from plist bytes (XML or binary).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        plist::from_bytes(bytes).map_err(|e| Error::Malformed(format!("pair record: {e}")))
    }

    /// Loads a record file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Directories searched by [`PairRecord::find`], in order.
    pub fn search_dirs() -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(dir) = std::env::var_os(ENV_LOCKDOWN_DIR) {
            dirs.push(PathBuf::from(dir));
        }
        dirs.push(PathBuf::from(SYSTEM_LOCKDOWN_DIR));
        if let Some(data) = dirs::data_local_dir() {
            dirs.push(data.join("mobdev").join("lockdown"));
        }
        dirs
    }

    /// Finds the record for `udid` in [`PairRecord::search_dirs`].
    pub fn find(udid: &str) -> Result<Self> {
        Self::find_in(&Self::search_dirs(), udid)
    }

    /// Finds the record for `udid` in the given directories.
    pub fn find_in(dirs: &[PathBuf], udid: &str) -> Result<Self> {
        if udid.is_empty() {
            return Err(Error::InvalidArg("empty UDID"));
        }
        let file = format!("{udid}.plist");
        dirs.iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
            .map_or_else(
                || Err(Error::NoDevice(format!("no pair record for {udid}"))),
                |path| Self::load(&path),
            )
    }

    /// TLS identity built from the host certificate and key.
    pub fn tls_identity(&self) -> Result<TlsIdentity> {
        TlsIdentity::from_pem(self.host_certificate.as_ref(), self.host_private_key.as_ref())
    }
}
