//! Data directory resolution and on-disk naming conventions.

use std::path::PathBuf;

/// Name of the root blob holding the replica id (4 bytes little-endian u32).
pub(crate) const ROOT_FILE_NAME: &str = "primary.db";

pub(crate) const WAL_FILE_PREFIX: &str = "wal_";
pub(crate) const WAL_FILE_SUFFIX: &str = ".db";

/// Base directory for persistent data (blobs, exports).
///
/// Uses `PLAIT_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/plait` or
/// `~/.local/share/plait`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLAIT_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("plait")
}

/// Base directory for configuration files.
///
/// Uses `PLAIT_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/plait` or
/// `~/.config/plait`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLAIT_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("plait")
}

/// File name for a blob with the given content checksum.
pub(crate) fn blob_file_name(id: &str) -> String {
    format!("{WAL_FILE_PREFIX}{id}{WAL_FILE_SUFFIX}")
}

/// Extract the content checksum from a blob file name, if it is one.
pub(crate) fn parse_blob_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// File name for a plain-text export taken at `unix_nanos`.
pub(crate) fn export_file_name(unix_nanos: i64) -> String {
    format!("export_{unix_nanos}.txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_file_name_roundtrip() {
        let name = blob_file_name("d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(name, "wal_d41d8cd98f00b204e9800998ecf8427e.db");
        assert_eq!(
            parse_blob_file_name(&name),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
    }

    #[test]
    fn parse_rejects_non_blob_names() {
        assert_eq!(parse_blob_file_name("primary.db"), None);
        assert_eq!(parse_blob_file_name("wal_.db"), None);
        assert_eq!(parse_blob_file_name("export_123.txt"), None);
    }
}
