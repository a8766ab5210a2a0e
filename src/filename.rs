//! Maildir filename codec.
//!
//! The filename is the only persistent index of the store: it embeds a
//! uniqueness prefix, the message UID, the folder fingerprint and the
//! flag set. Usual format is
//! `<timestamp>_<seq>.<pid>.<host>,U=<uid>,FMD5=<md5><infosep>2,<flags>`.

use regex::Regex;
use std::path;

use crate::Flags;

/// Default separator between the maildir name and the flag appendix.
pub const INFO_SEP: char = ':';

/// Alternate separator for filesystems that forbid colons.
pub const INFO_SEP_WINDOWS: char = '!';

/// Represents the decoded components of a maildir filename.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ParsedFilename {
    /// Everything up to the first comma or info separator.
    pub prefix: String,
    /// The embedded UID, when present and attributable to this folder.
    pub uid: Option<i64>,
    pub flags: Flags,
}

/// Encodes and decodes maildir filenames for one folder.
#[derive(Debug)]
pub struct FilenameCodec {
    infosep: char,
    fingerprint: String,
    /// What we substitute the path separator with in generated names.
    sep_subst: char,
    re_prefix: Regex,
    re_uid: Regex,
    re_flags: Regex,
    re_timestamp: Regex,
    re_fingerprint: Regex,
}

impl FilenameCodec {
    pub fn new<F: ToString>(fingerprint: F, windows_compatible: bool) -> Self {
        let infosep = if windows_compatible {
            INFO_SEP_WINDOWS
        } else {
            INFO_SEP
        };
        let sep = regex::escape(&infosep.to_string());
        let sep_subst = if path::MAIN_SEPARATOR == '-' { '_' } else { '-' };

        Self {
            infosep,
            fingerprint: fingerprint.to_string(),
            sep_subst,
            re_prefix: Regex::new(&format!("^[^{},]*", sep)).unwrap(),
            re_uid: Regex::new(r",U=(\d+)").unwrap(),
            re_flags: Regex::new(&format!(r"{}2,(\w*)", sep)).unwrap(),
            re_timestamp: Regex::new(r"\d+").unwrap(),
            re_fingerprint: Regex::new(r"FMD5=([0-9a-fA-F]+)").unwrap(),
        }
    }

    /// Returns the folder fingerprint embedded in encoded filenames.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Decodes a filename into its components.
    ///
    /// The embedded UID is meaningless unless the fingerprint marker
    /// matches the current folder fingerprint, so both a missing and a
    /// mismatched marker leave the UID unresolved. Missing or empty
    /// flag markers decode to an empty flag set.
    pub fn decode(&self, filename: &str) -> ParsedFilename {
        let prefix = self
            .re_prefix
            .find(filename)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();

        let foldermatch = filename.contains(&format!(",FMD5={}", self.fingerprint));
        let uid = if foldermatch {
            self.re_uid
                .captures(filename)
                .and_then(|c| c[1].parse::<i64>().ok())
        } else {
            None
        };

        let flags = self
            .re_flags
            .captures(filename)
            .map(|c| c[1].chars().collect())
            .unwrap_or_default();

        ParsedFilename { prefix, uid, flags }
    }

    /// Encodes a complete filename out of a prefix, a UID and a flag
    /// set, with flags emitted in sorted order.
    ///
    /// Path separators coming from the host part of the prefix are
    /// substituted so the result stays a single path segment.
    pub fn encode(&self, uid: i64, flags: &Flags, prefix: &str) -> String {
        let filename = format!(
            "{},U={},FMD5={}{}2,{}",
            prefix,
            uid,
            self.fingerprint,
            self.infosep,
            flags.to_maildir_string(),
        );
        filename.replace(path::MAIN_SEPARATOR, &self.sep_subst.to_string())
    }

    /// Removes an existing flag appendix, keeping the rest of the name.
    pub fn strip_flags<'a>(&self, filename: &'a str) -> &'a str {
        match self.re_flags.find(filename) {
            Some(m) => &filename[..m.start()],
            None => filename,
        }
    }

    /// Builds the flag appendix for the given set.
    pub fn flags_suffix(&self, flags: &Flags) -> String {
        format!("{}2,{}", self.infosep, flags.to_maildir_string())
    }

    /// Extracts the first numeric run of the name, which is the
    /// timestamp part of the uniqueness prefix when one is present.
    pub fn timestamp(&self, filename: &str) -> Option<i64> {
        self.re_timestamp
            .find(filename)
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Extracts any embedded fingerprint value, matching or not.
    pub fn embedded_fingerprint<'a>(&self, filename: &'a str) -> Option<&'a str> {
        self.re_fingerprint
            .captures(filename)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Flag, Flags};

    use super::FilenameCodec;

    const FP: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    #[test]
    fn decode_full_filename() {
        let codec = FilenameCodec::new(FP, false);
        let parsed = codec.decode(&format!("1000_0.123.host,U=5,FMD5={}:2,S", FP));

        assert_eq!("1000_0.123.host", parsed.prefix);
        assert_eq!(Some(5), parsed.uid);
        assert_eq!(Flags::from("S"), parsed.flags);
    }

    #[test]
    fn decode_ignores_uid_without_fingerprint() {
        let codec = FilenameCodec::new(FP, false);

        let parsed = codec.decode("1000_0.123.host,U=5:2,S");
        assert_eq!(None, parsed.uid);
        assert_eq!(Flags::from("S"), parsed.flags);
    }

    #[test]
    fn decode_ignores_uid_with_foreign_fingerprint() {
        let codec = FilenameCodec::new(FP, false);

        let parsed = codec.decode("1000_0.123.host,U=5,FMD5=deadbeef:2,S");
        assert_eq!(None, parsed.uid);
    }

    #[test]
    fn decode_tolerates_missing_markers() {
        let codec = FilenameCodec::new(FP, false);

        let parsed = codec.decode("not-a-maildir-name");
        assert_eq!("not-a-maildir-name", parsed.prefix);
        assert_eq!(None, parsed.uid);
        assert_eq!(Flags::default(), parsed.flags);
    }

    #[test]
    fn encode_decode_flags_round_trip() {
        let codec = FilenameCodec::new(FP, false);
        let flags = Flags::from_iter([Flag::Seen, Flag::Replied, Flag::Custom('a')]);

        let filename = codec.encode(12, &flags, "1000_0.123.host");
        assert_eq!(
            format!("1000_0.123.host,U=12,FMD5={}:2,RSa", FP),
            filename,
        );
        assert_eq!(flags, codec.decode(&filename).flags);
        assert_eq!(Some(12), codec.decode(&filename).uid);
    }

    #[test]
    fn encode_uses_windows_separator() {
        let codec = FilenameCodec::new(FP, true);
        let filename = codec.encode(3, &Flags::from("S"), "1000_0.123.host");

        assert!(filename.ends_with("!2,S"));
        assert_eq!(Some(3), codec.decode(&filename).uid);
        assert_eq!(Flags::from("S"), codec.decode(&filename).flags);
    }

    #[test]
    fn strip_flags_removes_appendix() {
        let codec = FilenameCodec::new(FP, false);

        assert_eq!("prefix,U=1", codec.strip_flags("prefix,U=1:2,RS"));
        assert_eq!("prefix,U=1", codec.strip_flags("prefix,U=1:2,"));
        assert_eq!("prefix,U=1", codec.strip_flags("prefix,U=1"));
    }

    #[test]
    fn timestamp_extracts_leading_number() {
        let codec = FilenameCodec::new(FP, false);

        assert_eq!(Some(1000), codec.timestamp("1000_2.123.host"));
        assert_eq!(None, codec.timestamp("no-number-at-all"));
    }
}
