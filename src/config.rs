use serde::Deserialize;
use std::path::PathBuf;

/// Represents the maildir store config.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MaildirConfig {
    /// Represents the directory containing the maildir folders.
    pub root_dir: PathBuf,
    /// Uses `!` instead of `:` as the separator between the maildir
    /// name and the flag appendix, for filesystems that forbid colons
    /// in filenames.
    pub windows_compatible: bool,
    /// Skips messages larger than this size (in bytes) when scanning.
    pub max_size: Option<u64>,
    /// Derives the filename timestamp from the Date header of the
    /// message instead of the wall clock.
    pub filename_use_mail_timestamp: bool,
    /// Sets the modification time of saved message files from the Date
    /// header.
    pub utime_from_header: bool,
    /// Forces written messages to disk before making them visible.
    pub fsync: bool,
}
