//! Maildir store module.
//!
//! This module contains the definition of the maildir store consumed
//! by the synchronizer: a message list cached from the `new` and `cur`
//! subdirectories, plus the operations mutating messages and their
//! flags through atomic filesystem renames. The filename is the only
//! persistent index, there is no sidecar file.

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use nix::unistd;
use std::{
    collections::HashMap,
    ffi::OsStr,
    fs, io,
    io::prelude::*,
    path::{Path, PathBuf},
    process, result,
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};
use thiserror::Error;

use crate::{FilenameCodec, Flag, Flags, MaildirConfig, Sequencer};

/// Subdirectory holding messages not yet seen.
pub const NEW_SUBDIR: &str = "new";

/// Subdirectory holding seen (processed) messages.
pub const CUR_SUBDIR: &str = "cur";

/// Staging subdirectory where messages are written before they become
/// visible under their final name.
pub const TMP_SUBDIR: &str = "tmp";

/// Sentinel identifier reported when a defective message carries no
/// recognizable Message-ID header.
pub const UNKNOWN_MESSAGE_ID: &str = "<unknown-message-id>";

const STAGING_TRIES: u32 = 7;
const STAGING_BACKOFF: Duration = Duration::from_millis(230);

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find message {0} in message list")]
    FindMsgError(i64),
    #[error("cannot create maildir subdirectory {1}")]
    CreateDirsError(#[source] io::Error, PathBuf),
    #[error("cannot read maildir directory {1}")]
    ReadDirError(#[source] io::Error, PathBuf),
    #[error("cannot get size of file {1}")]
    GetMetadataError(#[source] io::Error, PathBuf),
    #[error("cannot rename file {1} to {2}")]
    RenameMsgError(#[source] io::Error, PathBuf, PathBuf),
    #[error("cannot delete message file {1}")]
    DelMsgError(#[source] io::Error, PathBuf),
    #[error("cannot read message file {1}")]
    ReadMsgError(#[source] io::Error, PathBuf),
    #[error("cannot write staging file {1}")]
    WriteMsgError(#[source] io::Error, PathBuf),
    #[error("unique staging filename {1} already exists")]
    StagingCollisionError(#[source] io::Error, PathBuf),
    #[error("cannot parse message {1}")]
    ParseMsgError(#[source] mailparse::MailParseError, String),
    #[error("message {0} ({1}) has defects preventing it from being processed")]
    BoundaryDefectError(i64, String),
}

pub type Result<T> = result::Result<T, Error>;

/// Represents one cached message: its flag set and its path relative
/// to the folder root (`new/…`, `cur/…`, or `tmp/…` while staging).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MessageRecord {
    pub flags: Flags,
    pub filename: PathBuf,
}

/// Represents the in-memory message list, keyed by UID.
///
/// Positive UIDs were recovered from filenames carrying the folder
/// fingerprint. Negative UIDs denote messages present on disk without
/// an attributable UID, candidates for upload by the synchronizer.
pub type MessageList = HashMap<i64, MessageRecord>;

/// Outcome of a fingerprint migration run.
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Files renamed, or that would be renamed in dry-run mode.
    pub migrated: Vec<PathBuf>,
    /// Files whose fingerprint is neither the legacy nor the current
    /// one, reported but left untouched.
    pub inconsistent: Vec<PathBuf>,
}

/// Represents one maildir folder of the store.
///
/// All cache-mutating operations expect a single logical worker per
/// folder instance; only the [`Sequencer`] collaborator is shared
/// across workers.
pub struct MaildirStore {
    config: MaildirConfig,
    name: String,
    /// Full folder path, cached since every operation joins it.
    path: PathBuf,
    codec: FilenameCodec,
    hostname: String,
    sequencer: Arc<dyn Sequencer>,
    messages: MessageList,
}

impl MaildirStore {
    pub fn new<N: ToString>(
        config: MaildirConfig,
        name: N,
        sequencer: Arc<dyn Sequencer>,
    ) -> Self {
        let name = name.to_string();
        // The folder fingerprint, so recorded UIDs can be matched for
        // validity against the folder they were assigned in.
        let fingerprint = format!("{:x}", md5::compute(&name));
        let codec = FilenameCodec::new(fingerprint, config.windows_compatible);
        let path = config.root_dir.join(&name);
        let hostname = match unistd::gethostname() {
            Ok(hostname) => hostname.to_string_lossy().into_owned(),
            Err(err) => {
                warn!("cannot get hostname, using localhost: {}", err);
                String::from("localhost")
            }
        };

        Self {
            config,
            name,
            path,
            codec,
            hostname,
            sequencer,
            messages: MessageList::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the full folder path (sans `cur`/`new`/`tmp`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> &str {
        self.codec.fingerprint()
    }

    /// Creates the `new`, `cur` and `tmp` subdirectories when missing.
    pub fn create_dirs(&self) -> Result<()> {
        for subdir in [NEW_SUBDIR, CUR_SUBDIR, TMP_SUBDIR] {
            let dir = self.path.join(subdir);
            fs::create_dir_all(&dir).map_err(|err| Error::CreateDirsError(err, dir.clone()))?;
        }
        Ok(())
    }

    fn is_within_time(&self, filename: &str, min_date: DateTime<Utc>) -> bool {
        // Names that lost their timestamp token pass the filter.
        match self.codec.timestamp(filename) {
            Some(timestamp) => timestamp >= min_date.timestamp(),
            None => true,
        }
    }

    /// Builds the message list from the `new` and `cur` subdirectories.
    ///
    /// If `min_date` is set, the minimum UID of all messages newer than
    /// `min_date` becomes the real cutoff for considering messages.
    /// This handles the edge case where a message lost its
    /// timestamp-bearing prefix but carries a UID assigned later than
    /// messages that passed the date filter.
    pub fn scan(
        &self,
        min_date: Option<DateTime<Utc>>,
        min_uid: Option<i64>,
    ) -> Result<MessageList> {
        let mut files = Vec::new();
        for subdir in [NEW_SUBDIR, CUR_SUBDIR] {
            let dir = self.path.join(subdir);
            for entry in fs::read_dir(&dir).map_err(|err| Error::ReadDirError(err, dir.clone()))? {
                let entry = entry.map_err(|err| Error::ReadDirError(err, dir.clone()))?;
                match entry.file_name().into_string() {
                    Ok(filename) => files.push((subdir, filename)),
                    Err(filename) => {
                        warn!("skipping maildir entry with non-unicode name {:?}", filename)
                    }
                }
            }
        }

        let mut retval = MessageList::default();
        let mut date_excludees = MessageList::default();
        // Messages without an attributable UID get negative UIDs.
        let mut nouidcounter = -1i64;

        for (subdir, filename) in files {
            if filename.starts_with('.') {
                continue;
            }
            // We keep just subdir and filename, e.g. `cur/123…`.
            let filepath = PathBuf::from(subdir).join(&filename);

            if let Some(max_size) = self.config.max_size {
                let fullpath = self.path.join(&filepath);
                let size = fs::metadata(&fullpath)
                    .map_err(|err| Error::GetMetadataError(err, fullpath))?
                    .len();
                if size > max_size {
                    debug!("skipping {:?}, larger than {} bytes", filepath, max_size);
                    continue;
                }
            }

            let parsed = self.codec.decode(&filename);
            let uid = match parsed.uid {
                Some(uid) => uid,
                None => {
                    let uid = nouidcounter;
                    nouidcounter -= 1;
                    uid
                }
            };

            if let Some(min_uid) = min_uid {
                if uid > 0 && uid < min_uid {
                    continue;
                }
            }

            let record = MessageRecord {
                flags: parsed.flags,
                filename: filepath,
            };
            match min_date {
                Some(min_date) if !self.is_within_time(&filename, min_date) => {
                    // Parked rather than dropped: it may still carry a
                    // UID above the cutoff computed below.
                    date_excludees.insert(uid, record);
                }
                _ => {
                    retval.insert(uid, record);
                }
            }
        }

        if min_date.is_some() {
            // Re-include date-excluded messages with high enough UIDs,
            // so the resulting UID set stays consistent with what the
            // remote side reports for the same window. The threshold
            // considers positive UIDs only.
            if let Some(min_uid) = retval.keys().copied().filter(|&uid| uid > 0).min() {
                for (uid, record) in date_excludees {
                    if uid > min_uid {
                        retval.insert(uid, record);
                    }
                }
            }
        }

        Ok(retval)
    }

    /// Populates the message list cache, unless already populated.
    pub fn cache_message_list(
        &mut self,
        min_date: Option<DateTime<Utc>>,
        min_uid: Option<i64>,
    ) -> Result<()> {
        if self.messages.is_empty() {
            debug!("loading message list of folder {}", self.name);
            self.messages = self.scan(min_date, min_uid)?;
            debug!("loaded {} messages", self.messages.len());
        }
        Ok(())
    }

    pub fn message_list(&self) -> &MessageList {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn uids(&self) -> Vec<i64> {
        self.messages.keys().copied().collect()
    }

    pub fn record(&self, uid: i64) -> Option<&MessageRecord> {
        self.messages.get(&uid)
    }

    pub fn flags(&self, uid: i64) -> Result<&Flags> {
        self.messages
            .get(&uid)
            .map(|record| &record.flags)
            .ok_or(Error::FindMsgError(uid))
    }

    /// Returns true when the cached list differs from the reference
    /// snapshot, either by UID set or by any per-UID flag set.
    ///
    /// Performs no disk I/O, both sides must already be cached; cheap
    /// enough to run on every pass.
    pub fn has_changed_since(&self, reference: &HashMap<i64, Flags>) -> bool {
        let mut uids = self.uids();
        let mut reference_uids: Vec<i64> = reference.keys().copied().collect();
        uids.sort_unstable();
        reference_uids.sort_unstable();
        if uids != reference_uids {
            return true;
        }

        self.messages.iter().any(|(uid, record)| {
            reference
                .get(uid)
                .map_or(true, |flags| *flags != record.flags)
        })
    }

    /// Returns the modification time of the message file.
    pub fn message_time(&self, uid: i64) -> Result<SystemTime> {
        let record = self.messages.get(&uid).ok_or(Error::FindMsgError(uid))?;
        let filepath = self.path.join(&record.filename);
        fs::metadata(&filepath)
            .and_then(|metadata| metadata.modified())
            .map_err(|err| Error::GetMetadataError(err, record.filename.clone()))
    }

    /// Returns the raw message bytes at the cached path.
    ///
    /// Structural defects surfaced by the MIME parser escalate as
    /// errors carrying the extracted Message-ID; the one known
    /// recoverable defect, an improperly quoted multipart boundary, is
    /// repaired by quoting the boundary parameter and reparsing once.
    pub fn message(&self, uid: i64) -> Result<Vec<u8>> {
        let record = self.messages.get(&uid).ok_or(Error::FindMsgError(uid))?;
        let filepath = self.path.join(&record.filename);
        let raw =
            fs::read(&filepath).map_err(|err| Error::ReadMsgError(err, record.filename.clone()))?;

        let parsed = mailparse::parse_mail(&raw)
            .map_err(|err| Error::ParseMsgError(err, extract_message_id(&raw)))?;

        if has_boundary_defect(&parsed) {
            warn!(
                "message {} has defects, applying multipart boundary fix",
                uid
            );
            let fixed = quote_boundary_fix(&raw);
            let reparsed = mailparse::parse_mail(&fixed)
                .map_err(|err| Error::ParseMsgError(err, extract_message_id(&fixed)))?;
            if has_boundary_defect(&reparsed) {
                return Err(Error::BoundaryDefectError(uid, extract_message_id(&raw)));
            }
            return Ok(fixed);
        }

        Ok(raw)
    }

    fn new_message_filename(&self, uid: i64, flags: &Flags, date: Option<i64>) -> String {
        let (timestamp, seq) = self.sequencer.next(date);
        let prefix = format!(
            "{}_{}.{}.{}",
            timestamp,
            seq,
            process::id(),
            self.hostname
        );
        self.codec.encode(uid, flags, &prefix)
    }

    /// Extracts the message timestamp from the Date header, falling
    /// back to Delivery-date. Failures are logged, never fatal.
    fn message_date(&self, uid: i64, raw: &[u8]) -> Option<i64> {
        let parsed = match mailparse::parse_mail(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("message {} has an unparseable header section: {}", uid, err);
                return None;
            }
        };

        use mailparse::MailHeaderMap;
        let date = parsed
            .headers
            .get_first_value("Date")
            .or_else(|| parsed.headers.get_first_value("Delivery-date"))?;
        match mailparse::dateparse(&date) {
            Ok(timestamp) => Some(timestamp),
            Err(err) => {
                warn!(
                    "message {} has invalid date {:?} ({}), not using message timestamp",
                    uid, date, err
                );
                None
            }
        }
    }

    /// Writes the message to the named file in the `tmp` subdirectory,
    /// retrying exclusive creation a few times on name collisions.
    fn save_to_tmp_file(&self, filename: &str, raw: &[u8]) -> Result<PathBuf> {
        let tmpname = PathBuf::from(TMP_SUBDIR).join(filename);
        let tmppath = self.path.join(&tmpname);

        let mut tries = STAGING_TRIES;
        let mut file = loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmppath)
            {
                Ok(file) => break file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    // Token reuse by a concurrent writer, transient.
                    tries -= 1;
                    if tries == 0 {
                        return Err(Error::StagingCollisionError(err, tmpname));
                    }
                    thread::sleep(STAGING_BACKOFF);
                }
                Err(err) => return Err(Error::WriteMsgError(err, tmpname)),
            }
        };

        file.write_all(raw)
            .and_then(|()| file.flush())
            .map_err(|err| Error::WriteMsgError(err, tmpname.clone()))?;
        if self.config.fsync {
            // Make sure the data hits the disk.
            file.sync_all()
                .map_err(|err| Error::WriteMsgError(err, tmpname.clone()))?;
        }

        Ok(tmpname)
    }

    /// Best-effort adjustment of the file modification time from the
    /// Date header.
    fn set_mtime_from_header(&self, uid: i64, tmpname: &Path, raw: &[u8]) {
        let Some(date) = self.message_date(uid, raw) else {
            return;
        };
        let Ok(secs) = u64::try_from(date) else {
            warn!(
                "message {} has a pre-epoch date, not changing file modification time",
                uid
            );
            return;
        };

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        let outcome = fs::File::options()
            .write(true)
            .open(self.path.join(tmpname))
            .and_then(|file| file.set_modified(mtime));
        if let Err(err) = outcome {
            warn!(
                "cannot change modification time of message {}: {}",
                uid, err
            );
        }
    }

    /// Writes a new message with the specified UID and flags, and
    /// returns the UID it is stored under.
    ///
    /// A non-positive UID is returned unchanged without touching the
    /// disk: such a message still needs a remote-assigned UID. A UID
    /// already present degrades to a flags update, since message
    /// bodies are immutable once stored.
    pub fn save_message(&mut self, uid: i64, raw: &[u8], flags: &Flags) -> Result<i64> {
        debug!("saving message {} with flags {:?}", uid, flags);

        if uid <= 0 {
            // We cannot assign a new UID.
            return Ok(uid);
        }
        if self.messages.contains_key(&uid) {
            self.set_message_flags(uid, flags)?;
            return Ok(uid);
        }

        let message_timestamp = if self.config.filename_use_mail_timestamp {
            self.message_date(uid, raw)
        } else {
            None
        };

        let filename = self.new_message_filename(uid, flags, message_timestamp);
        let tmpname = self.save_to_tmp_file(&filename, raw)?;

        if self.config.utime_from_header {
            self.set_mtime_from_header(uid, &tmpname, raw);
        }

        self.messages.insert(
            uid,
            MessageRecord {
                flags: flags.clone(),
                filename: tmpname,
            },
        );
        // The flag transition moves the message to `cur` or `new`.
        self.set_message_flags(uid, flags)?;

        trace!("saved message {}", uid);
        Ok(uid)
    }

    /// Sets the message flags, relocating the file between the `new`
    /// and `cur` subdirectories when the Seen flag toggles.
    ///
    /// Unchanged flags perform no filesystem operation at all; the
    /// cache and the on-disk location are updated in lockstep
    /// otherwise.
    pub fn set_message_flags(&mut self, uid: i64, flags: &Flags) -> Result<()> {
        let record = self.messages.get(&uid).ok_or(Error::FindMsgError(uid))?;

        let oldfilename = record.filename.clone();
        let mut filename = oldfilename
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
            .to_owned();
        // A seen message goes into `cur`, any other into `new`.
        let subdir = if flags.contains(&Flag::Seen) {
            CUR_SUBDIR
        } else {
            NEW_SUBDIR
        };

        if *flags != record.flags {
            // Strip any existing flag appendix before rebuilding it.
            filename = self.codec.strip_flags(&filename).to_owned();
            filename.push_str(&self.codec.flags_suffix(flags));
        }

        let newfilename = PathBuf::from(subdir).join(filename);
        if newfilename != oldfilename {
            fs::rename(self.path.join(&oldfilename), self.path.join(&newfilename)).map_err(
                |err| Error::RenameMsgError(err, oldfilename.clone(), newfilename.clone()),
            )?;

            if let Some(record) = self.messages.get_mut(&uid) {
                record.flags = flags.clone();
                record.filename = newfilename;
            }
        }

        Ok(())
    }

    /// Changes the message UID through a rename, re-keying the cache
    /// entry. The status bookkeeping of the remote side is left to the
    /// caller.
    pub fn change_message_uid(&mut self, uid: i64, new_uid: i64) -> Result<()> {
        let record = self.messages.get(&uid).ok_or(Error::FindMsgError(uid))?;
        if uid == new_uid {
            return Ok(());
        }

        let oldfilename = record.filename.clone();
        let subdir = oldfilename.parent().map(Path::to_owned).unwrap_or_default();
        let newfilename = subdir.join(self.new_message_filename(new_uid, &record.flags, None));

        fs::rename(self.path.join(&oldfilename), self.path.join(&newfilename)).map_err(|err| {
            Error::RenameMsgError(err, oldfilename.clone(), newfilename.clone())
        })?;

        if let Some(mut record) = self.messages.remove(&uid) {
            record.filename = newfilename;
            self.messages.insert(new_uid, record);
        }

        Ok(())
    }

    /// Unlinks the message file and removes the cache entry.
    ///
    /// When the file is already gone, one re-scan locates it under a
    /// possibly different path; still missing means already deleted,
    /// which is not an error.
    pub fn delete_message(&mut self, uid: i64) -> Result<()> {
        let record = self.messages.get(&uid).ok_or(Error::FindMsgError(uid))?;
        let filename = record.filename.clone();

        if let Err(err) = fs::remove_file(self.path.join(&filename)) {
            debug!(
                "cannot delete message file {:?} ({}), rescanning folder",
                filename, err
            );
            match self.scan(None, None)?.get(&uid) {
                Some(record) => {
                    fs::remove_file(self.path.join(&record.filename))
                        .map_err(|err| Error::DelMsgError(err, record.filename.clone()))?;
                }
                None => debug!("message {} already deleted", uid),
            }
        }

        self.messages.remove(&uid);
        Ok(())
    }

    /// Renames every file whose embedded fingerprint equals the given
    /// legacy value so it carries the current fingerprint instead.
    ///
    /// Files with an unrecognized fingerprint are reported as
    /// inconsistent but left untouched. In dry-run mode all detection
    /// and reporting happens without renaming.
    pub fn migrate_fingerprint(&self, legacy: &str, dry_run: bool) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();

        for (_, record) in self.scan(None, None)? {
            let filename = match record.filename.file_name().and_then(OsStr::to_str) {
                Some(filename) => filename.to_owned(),
                None => continue,
            };

            match self.codec.embedded_fingerprint(&filename) {
                None => {
                    debug!(
                        "file {:?} does not have a fingerprint assigned",
                        record.filename
                    );
                }
                Some(fingerprint) if fingerprint == legacy => {
                    info!(
                        "migrating file {:?} to fingerprint {}",
                        record.filename,
                        self.codec.fingerprint()
                    );
                    if dry_run {
                        report.migrated.push(record.filename.clone());
                        continue;
                    }

                    let newname = filename.replace(
                        &format!("FMD5={}", fingerprint),
                        &format!("FMD5={}", self.codec.fingerprint()),
                    );
                    let newfilename = record.filename.with_file_name(newname);
                    fs::rename(
                        self.path.join(&record.filename),
                        self.path.join(&newfilename),
                    )
                    .map_err(|err| {
                        Error::RenameMsgError(err, record.filename.clone(), newfilename.clone())
                    })?;
                    report.migrated.push(newfilename);
                }
                Some(fingerprint) if fingerprint != self.codec.fingerprint() => {
                    warn!(
                        "inconsistent fingerprint for file {:?}: neither {} nor {} found",
                        record.filename,
                        legacy,
                        self.codec.fingerprint()
                    );
                    report.inconsistent.push(record.filename.clone());
                }
                Some(_) => (),
            }
        }

        Ok(report)
    }
}

fn has_boundary_defect(parsed: &mailparse::ParsedMail) -> bool {
    parsed.ctype.mimetype.starts_with("multipart/") && parsed.subparts.is_empty()
}

/// Quotes the first unquoted multipart boundary parameter, the
/// (hopefully) rare defect from broken clients.
fn quote_boundary_fix(raw: &[u8]) -> Vec<u8> {
    regex::bytes::Regex::new(r#"(?i)boundary=([^";\r\n]+)"#)
        .unwrap()
        .replace(raw, &b"boundary=\"$1\""[..])
        .into_owned()
}

fn extract_message_id(raw: &[u8]) -> String {
    regex::bytes::Regex::new(r"(?i)message-id:[ \t]*(<[^>\r\n]+>)")
        .unwrap()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_else(|| String::from(UNKNOWN_MESSAGE_ID))
}
