//! Per-file metadata records and their on-disk log format.
//!
//! One record is written per processed file:
//!
//! ```text
//! file_type,mode,atime,ctime,mtime,size,owner,group,uid,gid,name[,digest:digest:...]
//! ```
//!
//! `mode` is octal, times are seconds since the epoch. `owner`, `group` and
//! `name` are percent-encoded so a comma or newline in a file name cannot
//! split the record. `name` is encoded from its raw bytes, so paths that are
//! not UTF-8 survive unchanged. The digest list is omitted for files with no blocks.

use crate::error::{BackupError, BackupResult};
use crate::fingerprint::BlockDigest;
use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::Metadata;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const S_IFMT: u32 = 0o170000;

/// Kind of filesystem object a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Character device
    CharDevice,
    /// Block device
    BlockDevice,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
    /// Type bits not recognized
    Unknown,
}

impl FileType {
    /// Derive the file type from `st_mode` type bits
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            0o100000 => FileType::Regular,
            0o040000 => FileType::Directory,
            0o120000 => FileType::Symlink,
            0o020000 => FileType::CharDevice,
            0o060000 => FileType::BlockDevice,
            0o010000 => FileType::Fifo,
            0o140000 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// Single-character tag used in the record format
    pub fn as_char(self) -> char {
        match self {
            FileType::Regular => 'f',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::CharDevice => 'c',
            FileType::BlockDevice => 'b',
            FileType::Fifo => 'p',
            FileType::Socket => 's',
            FileType::Unknown => '?',
        }
    }

    /// Inverse of [`FileType::as_char`]
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'f' => FileType::Regular,
            'd' => FileType::Directory,
            'l' => FileType::Symlink,
            'c' => FileType::CharDevice,
            'b' => FileType::BlockDevice,
            'p' => FileType::Fifo,
            's' => FileType::Socket,
            '?' => FileType::Unknown,
            _ => return None,
        })
    }
}

/// Everything needed to rebuild one file from stored blocks.
///
/// `digests` lists the file's blocks in emission order. Its length equals
/// the number of blocks the file was split into; reordering it corrupts
/// reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Object kind
    pub file_type: FileType,
    /// Full `st_mode`, type and permission bits
    pub mode: u32,
    /// Last access time, seconds since the epoch
    pub atime: i64,
    /// Last status change time, seconds since the epoch
    pub ctime: i64,
    /// Last modification time, seconds since the epoch
    pub mtime: i64,
    /// Size in bytes at the time the file was opened
    pub size: u64,
    /// Owner user name, or the numeric uid when unresolvable
    pub owner: String,
    /// Owner group name, or the numeric gid when unresolvable
    pub group: String,
    /// Numeric owner id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
    /// Path the file was read from
    pub name: PathBuf,
    /// Block digests in file order
    pub digests: Vec<BlockDigest>,
}

impl FileMetadata {
    /// Capture metadata for `path` from an already obtained `stat` result.
    /// The digest list starts empty.
    pub fn from_fs(path: &Path, meta: &Metadata) -> Self {
        let uid = meta.uid();
        let gid = meta.gid();
        Self {
            file_type: FileType::from_mode(meta.mode()),
            mode: meta.mode(),
            atime: meta.atime(),
            ctime: meta.ctime(),
            mtime: meta.mtime(),
            size: meta.size(),
            owner: owner_name(uid),
            group: group_name(gid),
            uid,
            gid,
            name: path.to_path_buf(),
            digests: Vec::new(),
        }
    }

    /// Attach the completed digest list
    pub fn with_digests(mut self, digests: Vec<BlockDigest>) -> Self {
        self.digests = digests;
        self
    }

    /// Number of blocks the file was split into
    pub fn block_count(&self) -> usize {
        self.digests.len()
    }

    /// Render as one newline-terminated log record
    pub fn to_record(&self) -> String {
        let mut line = format!(
            "{},{:o},{},{},{},{},{},{},{},{},{}",
            self.file_type.as_char(),
            self.mode,
            self.atime,
            self.ctime,
            self.mtime,
            self.size,
            urlencoding::encode(&self.owner),
            urlencoding::encode(&self.group),
            self.uid,
            self.gid,
            urlencoding::encode_binary(self.name.as_os_str().as_bytes()),
        );
        if !self.digests.is_empty() {
            line.push(',');
            let rendered: Vec<String> = self.digests.iter().map(BlockDigest::to_hex).collect();
            line.push_str(&rendered.join(":"));
        }
        line.push('\n');
        line
    }

    /// Parse one record, with or without its trailing newline
    pub fn parse_record(line: &str) -> BackupResult<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 11 && fields.len() != 12 {
            return Err(BackupError::MalformedRecord(format!(
                "expected 11 or 12 fields, found {}",
                fields.len()
            )));
        }

        let mut type_chars = fields[0].chars();
        let file_type = match (type_chars.next(), type_chars.next()) {
            (Some(c), None) => FileType::from_char(c),
            _ => None,
        }
        .ok_or_else(|| BackupError::MalformedRecord(format!("bad file type {:?}", fields[0])))?;

        let mode = u32::from_str_radix(fields[1], 8)
            .map_err(|_| BackupError::MalformedRecord(format!("bad mode {:?}", fields[1])))?;

        let digests = match fields.get(11) {
            Some(list) => list
                .split(':')
                .map(BlockDigest::from_hex)
                .collect::<BackupResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            file_type,
            mode,
            atime: parse_num(fields[2], "atime")?,
            ctime: parse_num(fields[3], "ctime")?,
            mtime: parse_num(fields[4], "mtime")?,
            size: parse_num(fields[5], "size")?,
            owner: decode(fields[6])?,
            group: decode(fields[7])?,
            uid: parse_num(fields[8], "uid")?,
            gid: parse_num(fields[9], "gid")?,
            name: decode_path(fields[10]),
            digests,
        })
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, what: &str) -> BackupResult<T> {
    field
        .parse()
        .map_err(|_| BackupError::MalformedRecord(format!("bad {} {:?}", what, field)))
}

fn decode(field: &str) -> BackupResult<String> {
    urlencoding::decode(field)
        .map(|s| s.into_owned())
        .map_err(|e| BackupError::MalformedRecord(e.to_string()))
}

fn decode_path(field: &str) -> PathBuf {
    let raw = urlencoding::decode_binary(field.as_bytes()).into_owned();
    PathBuf::from(OsString::from_vec(raw))
}

fn owner_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> FileMetadata {
        FileMetadata {
            file_type: FileType::Regular,
            mode: 0o100644,
            atime: 1_700_000_000,
            ctime: 1_700_000_001,
            mtime: 1_700_000_002,
            size: 40_000,
            owner: "alice".into(),
            group: "staff".into(),
            uid: 1000,
            gid: 50,
            name: "/home/alice/report.txt".into(),
            digests: vec![BlockDigest::of(b"one"), BlockDigest::of(b"two")],
        }
    }

    #[test]
    fn record_field_order() {
        let rec = sample().to_record();
        assert!(rec.ends_with('\n'));
        let fields: Vec<&str> = rec.trim_end().split(',').collect();
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[0], "f");
        assert_eq!(fields[1], "100644");
        assert_eq!(fields[5], "40000");
        assert_eq!(fields[6], "alice");
        assert_eq!(fields[10], "%2Fhome%2Falice%2Freport.txt");
        assert_eq!(fields[11].split(':').count(), 2);
    }

    #[test]
    fn empty_file_has_no_digest_field() {
        let meta = FileMetadata {
            digests: Vec::new(),
            size: 0,
            ..sample()
        };
        let rec = meta.to_record();
        assert_eq!(rec.trim_end().split(',').count(), 11);
        assert_eq!(FileMetadata::parse_record(&rec).unwrap(), meta);
    }

    #[test]
    fn awkward_names_survive() {
        let meta = FileMetadata {
            name: "/tmp/a,b\nc d%.txt".into(),
            owner: "x,y".into(),
            ..sample()
        };
        let parsed = FileMetadata::parse_record(&meta.to_record()).unwrap();
        assert_eq!(parsed.name, Path::new("/tmp/a,b\nc d%.txt"));
        assert_eq!(parsed.owner, "x,y");
        assert_eq!(parsed.digests, meta.digests);
    }

    #[test]
    fn non_utf8_name_is_kept_byte_for_byte() {
        let raw = b"/data/caf\xe9.txt".to_vec();
        let meta = FileMetadata {
            name: PathBuf::from(OsString::from_vec(raw.clone())),
            ..sample()
        };
        let rec = meta.to_record();
        assert!(rec.contains("caf%E9.txt"));
        let parsed = FileMetadata::parse_record(&rec).unwrap();
        assert_eq!(parsed.name.as_os_str().as_bytes(), &raw[..]);
        assert_eq!(parsed, meta);
    }

    #[test]
    fn malformed_records_rejected() {
        assert!(matches!(
            FileMetadata::parse_record("f,644,1,2"),
            Err(BackupError::MalformedRecord(_))
        ));
        assert!(FileMetadata::parse_record("x,644,1,2,3,4,o,g,1,1,n").is_err());
        assert!(FileMetadata::parse_record("f,9z,1,2,3,4,o,g,1,1,n").is_err());
        assert!(matches!(
            FileMetadata::parse_record("f,644,1,2,3,4,o,g,1,1,n,zz"),
            Err(BackupError::InvalidDigest(_))
        ));
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(0o100755), FileType::Regular);
        assert_eq!(FileType::from_mode(0o040755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
        assert_eq!(FileType::from_mode(0o000644), FileType::Unknown);
    }

    #[test]
    fn from_fs_captures_stat() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"twelve bytes").unwrap();
        let stat = file.as_file().metadata().unwrap();
        let meta = FileMetadata::from_fs(file.path(), &stat);
        assert_eq!(meta.file_type, FileType::Regular);
        assert_eq!(meta.size, 12);
        assert_eq!(meta.uid, stat.uid());
        assert!(!meta.owner.is_empty());
        assert!(meta.digests.is_empty());
    }
}
