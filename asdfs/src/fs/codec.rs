//! Record codec: the persisted shape of inode records.
//!
//! Owns the bin names, the directory-map layout, the timestamp wire format,
//! and the coercion from the store's generic values to concrete widths. The
//! operations layer never touches raw bins directly.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::store::{Bin, Record, Value};

pub const BIN_MODE: &str = "Mode";
pub const BIN_UID: &str = "Uid";
pub const BIN_GID: &str = "Gid";
pub const BIN_NLINK: &str = "Nlink";
pub const BIN_SIZE: &str = "Size";
pub const BIN_BLOCK_SIZE: &str = "BlockSize";
pub const BIN_BLOCKS: &str = "Blocks";
pub const BIN_RDEV: &str = "Rdev";
pub const BIN_FLAGS: &str = "Flags";
pub const BIN_ATIME: &str = "Atime";
pub const BIN_CTIME: &str = "Ctime";
pub const BIN_MTIME: &str = "Mtime";
pub const BIN_LS: &str = "Ls";
pub const BIN_DATA: &str = "data";
pub const BIN_TARGET: &str = "target";

/// Attribute bins fetched for `stat`.
pub const ATTR_BINS: &[&str] = &[
    BIN_ATIME,
    BIN_BLOCK_SIZE,
    BIN_BLOCKS,
    BIN_CTIME,
    BIN_FLAGS,
    BIN_GID,
    BIN_MODE,
    BIN_MTIME,
    BIN_NLINK,
    BIN_RDEV,
    BIN_SIZE,
    BIN_UID,
];

/// Nominal block size reported to `stat`; directories report this as their
/// logical size.
pub const BLOCK_SIZE: u32 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bin {0} missing")]
    MissingBin(&'static str),
    #[error("bin {0} has unexpected type")]
    BinType(&'static str),
    #[error("value of {0} out of range")]
    Range(&'static str),
    #[error("unknown entry type code {0}")]
    UnknownEntryType(i64),
}

/// Dirent type discriminator stored in directory maps, using the kernel's
/// dirent codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Directory,
    File,
    Symlink,
}

impl EntryType {
    pub fn code(self) -> i64 {
        match self {
            EntryType::Directory => 4,
            EntryType::File => 8,
            EntryType::Symlink => 10,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, CodecError> {
        match code {
            4 => Ok(EntryType::Directory),
            8 => Ok(EntryType::File),
            10 => Ok(EntryType::Symlink),
            other => Err(CodecError::UnknownEntryType(other)),
        }
    }
}

/// Decoded inode attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeAttr {
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub block_size: u32,
    pub blocks: u64,
    pub rdev: u32,
    pub flags: u32,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

impl InodeAttr {
    /// Entry type derived from the mode type bits. Unknown type bits read as
    /// a regular file; the type flag is set by this crate on every create.
    pub fn entry_type(&self) -> EntryType {
        match self.mode & libc::S_IFMT {
            libc::S_IFDIR => EntryType::Directory,
            libc::S_IFLNK => EntryType::Symlink,
            _ => EntryType::File,
        }
    }
}

/// One directory entry value: `{Inode, Type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsEntry {
    pub inode: u64,
    pub entry_type: EntryType,
}

impl LsEntry {
    pub fn to_value(self) -> Value {
        let mut m = BTreeMap::new();
        m.insert("Inode".to_owned(), Value::Int(self.inode as i64));
        m.insert("Type".to_owned(), Value::Int(self.entry_type.code()));
        Value::Map(m)
    }

    pub fn from_value(v: &Value) -> Result<Self, CodecError> {
        let map = v.as_map().ok_or(CodecError::BinType(BIN_LS))?;
        let inode = map
            .get("Inode")
            .and_then(Value::as_int)
            .ok_or(CodecError::BinType(BIN_LS))?;
        let code = map
            .get("Type")
            .and_then(Value::as_int)
            .ok_or(CodecError::BinType(BIN_LS))?;
        Ok(Self {
            inode: u64::try_from(inode).map_err(|_| CodecError::Range(BIN_LS))?,
            entry_type: EntryType::from_code(code)?,
        })
    }
}

/// Directory listing map, key-ordered by entry name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ls(pub BTreeMap<String, LsEntry>);

impl Ls {
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(name, entry)| (name.clone(), entry.to_value()))
                .collect(),
        )
    }

    pub fn from_value(v: &Value) -> Result<Self, CodecError> {
        let map = v.as_map().ok_or(CodecError::BinType(BIN_LS))?;
        let mut entries = BTreeMap::new();
        for (name, value) in map {
            entries.insert(name.clone(), LsEntry::from_value(value)?);
        }
        Ok(Self(entries))
    }
}

/// Timestamps travel as RFC3339 text with seconds precision.
pub fn encode_time(t: DateTime<Utc>) -> Value {
    Value::Str(t.to_rfc3339_opts(SecondsFormat::Secs, false))
}

/// Parse failures decode to the zero instant.
pub fn decode_time(v: &Value) -> DateTime<Utc> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn bin_i64(record: &Record, name: &'static str) -> Result<i64, CodecError> {
    record
        .bin(name)
        .ok_or(CodecError::MissingBin(name))?
        .as_int()
        .ok_or(CodecError::BinType(name))
}

fn bin_u64(record: &Record, name: &'static str) -> Result<u64, CodecError> {
    u64::try_from(bin_i64(record, name)?).map_err(|_| CodecError::Range(name))
}

fn bin_u32(record: &Record, name: &'static str) -> Result<u32, CodecError> {
    u32::try_from(bin_i64(record, name)?).map_err(|_| CodecError::Range(name))
}

fn bin_time(record: &Record, name: &'static str) -> Result<DateTime<Utc>, CodecError> {
    Ok(decode_time(record.bin(name).ok_or(CodecError::MissingBin(name))?))
}

/// Decode the attribute bins of an inode record.
pub fn decode_attr(inode: u64, record: &Record) -> Result<InodeAttr, CodecError> {
    Ok(InodeAttr {
        inode,
        mode: bin_u32(record, BIN_MODE)?,
        uid: bin_u32(record, BIN_UID)?,
        gid: bin_u32(record, BIN_GID)?,
        nlink: bin_u32(record, BIN_NLINK)?,
        size: bin_u64(record, BIN_SIZE)?,
        block_size: bin_u32(record, BIN_BLOCK_SIZE)?,
        blocks: bin_u64(record, BIN_BLOCKS)?,
        rdev: bin_u32(record, BIN_RDEV)?,
        flags: bin_u32(record, BIN_FLAGS)?,
        atime: bin_time(record, BIN_ATIME)?,
        mtime: bin_time(record, BIN_MTIME)?,
        ctime: bin_time(record, BIN_CTIME)?,
    })
}

fn common_bins(mode: u32, uid: u32, gid: u32, size: u64, now: DateTime<Utc>) -> Vec<Bin> {
    vec![
        Bin::new(BIN_ATIME, encode_time(now)),
        Bin::new(BIN_CTIME, encode_time(now)),
        Bin::new(BIN_MTIME, encode_time(now)),
        Bin::new(BIN_BLOCK_SIZE, Value::Int(BLOCK_SIZE as i64)),
        Bin::new(BIN_BLOCKS, Value::Int(1)),
        Bin::new(BIN_GID, Value::Int(gid as i64)),
        Bin::new(BIN_UID, Value::Int(uid as i64)),
        Bin::new(BIN_SIZE, Value::Int(size as i64)),
        Bin::new(BIN_RDEV, Value::Int(0)),
        Bin::new(BIN_NLINK, Value::Int(1)),
        Bin::new(BIN_FLAGS, Value::Int(0)),
        Bin::new(BIN_MODE, Value::Int(mode as i64)),
    ]
}

/// Bins for a fresh directory record with an empty listing.
pub fn new_dir_bins(mode: u32, uid: u32, gid: u32, now: DateTime<Utc>) -> Vec<Bin> {
    let mut bins = common_bins(mode, uid, gid, BLOCK_SIZE as u64, now);
    bins.push(Bin::new(BIN_LS, Ls::default().to_value()));
    bins
}

/// Bins for a fresh empty file record.
pub fn new_file_bins(mode: u32, uid: u32, gid: u32, now: DateTime<Utc>) -> Vec<Bin> {
    let mut bins = common_bins(mode, uid, gid, 0, now);
    bins.push(Bin::new(BIN_DATA, Value::Blob(Vec::new())));
    bins
}

/// Bins for a fresh symlink record.
pub fn new_symlink_bins(target: &str, uid: u32, gid: u32, now: DateTime<Utc>) -> Vec<Bin> {
    let mode = libc::S_IFLNK | 0o777;
    let mut bins = common_bins(mode, uid, gid, target.len() as u64, now);
    bins.push(Bin::new(BIN_TARGET, Value::Str(target.to_owned())));
    bins
}

/// Mtime/Atime refresh attached to parent-directory mutations.
pub fn touch_bins(now: DateTime<Utc>) -> Vec<Bin> {
    vec![
        Bin::new(BIN_MTIME, encode_time(now)),
        Bin::new(BIN_ATIME, encode_time(now)),
    ]
}

/// Serve the `[offset, offset + size)` slice of a whole-file blob, clipped to
/// the file bounds.
pub fn clip(data: &[u8], offset: i64, size: u32) -> &[u8] {
    if offset < 0 {
        return &[];
    }
    let start = (offset as u64).min(data.len() as u64) as usize;
    let end = (start + size as usize).min(data.len());
    &data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(bins: Vec<Bin>) -> Record {
        Record {
            bins: bins
                .into_iter()
                .map(|b| (b.name.to_owned(), b.value))
                .collect(),
        }
    }

    #[test]
    fn attr_round_trip() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let rec = record(new_file_bins(libc::S_IFREG | 0o644, 1000, 100, now));
        let attr = decode_attr(42, &rec).unwrap();
        assert_eq!(attr.inode, 42);
        assert_eq!(attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 100);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.block_size, BLOCK_SIZE);
        assert_eq!(attr.blocks, 1);
        assert_eq!(attr.atime, now);
        assert_eq!(attr.mtime, now);
        assert_eq!(attr.ctime, now);
        assert_eq!(attr.entry_type(), EntryType::File);
    }

    #[test]
    fn dir_reports_block_size_as_size() {
        let now = Utc::now();
        let rec = record(new_dir_bins(libc::S_IFDIR | 0o755, 0, 0, now));
        let attr = decode_attr(1, &rec).unwrap();
        assert_eq!(attr.size, BLOCK_SIZE as u64);
        assert_eq!(attr.entry_type(), EntryType::Directory);
    }

    #[test]
    fn missing_bin_is_fatal() {
        let mut rec = record(new_file_bins(0o644, 0, 0, Utc::now()));
        rec.bins.remove(BIN_NLINK);
        assert_eq!(decode_attr(1, &rec), Err(CodecError::MissingBin(BIN_NLINK)));
    }

    #[test]
    fn type_mismatch_is_fatal() {
        let mut rec = record(new_file_bins(0o644, 0, 0, Utc::now()));
        rec.bins.insert(BIN_SIZE.to_owned(), Value::Str("5".into()));
        assert_eq!(decode_attr(1, &rec), Err(CodecError::BinType(BIN_SIZE)));
    }

    #[test]
    fn time_survives_round_trip_at_second_precision() {
        let t = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(decode_time(&encode_time(t)), t);
    }

    #[test]
    fn garbage_time_decodes_to_zero_instant() {
        assert_eq!(decode_time(&Value::Str("not-a-time".into())), DateTime::UNIX_EPOCH);
        assert_eq!(decode_time(&Value::Int(7)), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn ls_round_trip_is_key_ordered() {
        let mut ls = Ls::default();
        ls.0.insert(
            "zz".into(),
            LsEntry { inode: 3, entry_type: EntryType::File },
        );
        ls.0.insert(
            "aa".into(),
            LsEntry { inode: 2, entry_type: EntryType::Directory },
        );
        let decoded = Ls::from_value(&ls.to_value()).unwrap();
        assert_eq!(decoded, ls);
        let names: Vec<_> = decoded.0.keys().cloned().collect();
        assert_eq!(names, vec!["aa", "zz"]);
    }

    #[test]
    fn ls_entry_unknown_type_code() {
        let mut m = BTreeMap::new();
        m.insert("Inode".to_owned(), Value::Int(9));
        m.insert("Type".to_owned(), Value::Int(6));
        assert_eq!(
            LsEntry::from_value(&Value::Map(m)),
            Err(CodecError::UnknownEntryType(6))
        );
    }

    #[test]
    fn clip_stays_in_bounds() {
        let data = b"hello world";
        assert_eq!(clip(data, 0, 5), b"hello");
        assert_eq!(clip(data, 6, 100), b"world");
        assert_eq!(clip(data, 11, 4), b"");
        assert_eq!(clip(data, 400, 4), b"");
        assert_eq!(clip(data, -3, 4), b"");
        assert_eq!(clip(b"", 0, 8), b"");
    }
}
