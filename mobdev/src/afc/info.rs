//! Typed view of get-file-info replies.

use std::time::{Duration, SystemTime};

use super::AfcError;

/// Kind of file-system object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FileType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// Socket.
    Socket,
    /// Anything else.
    Unknown,
}

impl FileType {
    fn from_ifmt(s: &str) -> Self {
        match s {
            "S_IFREG" => Self::Regular,
            "S_IFDIR" => Self::Directory,
            "S_IFLNK" => Self::Symlink,
            "S_IFCHR" => Self::CharDevice,
            "S_IFBLK" => Self::BlockDevice,
            "S_IFIFO" => Self::Fifo,
            "S_IFSOCK" => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// File attributes reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FileInfo {
    /// Size in bytes.
    pub size: u64,
    /// Allocated blocks.
    pub blocks: u64,
    /// Hard link count.
    pub nlink: u64,
    /// Object kind.
    pub file_type: FileType,
    /// Modification time, nanoseconds since the Unix epoch.
    pub mtime_ns: Option<u64>,
    /// Creation time, nanoseconds since the Unix epoch.
    pub birthtime_ns: Option<u64>,
    /// Target of a symbolic link.
    pub link_target: Option<String>,
    /// Keys not covered above, in reply order.
    pub extra: Vec<(String, String)>,
}

impl FileInfo {
    /// Builds the view from the raw key/value pairs.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Result<Self, AfcError> {
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| AfcError::InvalidArg("non-numeric file attribute"))
        };
        let mut info = Self {
            size: 0,
            blocks: 0,
            nlink: 0,
            file_type: FileType::Unknown,
            mtime_ns: None,
            birthtime_ns: None,
            link_target: None,
            extra: Vec::new(),
        };
        for (key, value) in pairs {
            match key.as_str() {
                "st_size" => info.size = number(&value)?,
                "st_blocks" => info.blocks = number(&value)?,
                "st_nlink" => info.nlink = number(&value)?,
                "st_ifmt" => info.file_type = FileType::from_ifmt(&value),
                "st_mtime" => info.mtime_ns = Some(number(&value)?),
                "st_birthtime" => info.birthtime_ns = Some(number(&value)?),
                "LinkTarget" => info.link_target = Some(value),
                _ => info.extra.push((key, value)),
            }
        }
        Ok(info)
    }

    /// Whether the object is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Modification time.
    pub fn modified(&self) -> Option<SystemTime> {
        self.mtime_ns
            .map(|ns| SystemTime::UNIX_EPOCH + Duration::from_nanos(ns))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn parses_known_keys() {
        let info = FileInfo::from_pairs(pairs(&[
            ("st_size", "1024"),
            ("st_blocks", "8"),
            ("st_nlink", "1"),
            ("st_ifmt", "S_IFLNK"),
            ("st_mtime", "1700000000000000000"),
            ("LinkTarget", "/var/mobile"),
            ("st_flags", "0"),
        ]))
        .unwrap();
        assert_eq!(info.size, 1024);
        assert_eq!(info.file_type, FileType::Symlink);
        assert_eq!(info.link_target.as_deref(), Some("/var/mobile"));
        assert_eq!(info.extra, pairs(&[("st_flags", "0")]));
        assert_eq!(
            info.modified().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
        assert!(!info.is_dir());
    }

    #[test]
    fn rejects_non_numeric_size() {
        assert!(FileInfo::from_pairs(pairs(&[("st_size", "big")])).is_err());
    }
}
