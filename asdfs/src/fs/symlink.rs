//! Symbolic link operations. Creation lives with the other name-creating
//! directory operations; this module covers target readback and attribute
//! access. Writes to symlinks are not supported.

use tracing::{debug, error};

use crate::fs::codec::{InodeAttr, BIN_TARGET};
use crate::fs::errors::FsError;
use crate::fs::Asdfs;
use crate::store::{RecordKey, Value};

impl Asdfs {
    /// Return the stored target, verbatim. No resolution or
    /// canonicalisation happens here.
    pub async fn readlink(&self, inode: u64) -> Result<String, FsError> {
        debug!("readlink {inode}");
        let key = RecordKey::fs(inode);
        let record = self
            .store
            .get(&self.detached_read_policy(), &key, &[BIN_TARGET])
            .await
            .map_err(|e| {
                error!("readlink {inode}: {e}");
                FsError::from(e)
            })?;
        let target = record
            .bin(BIN_TARGET)
            .and_then(Value::as_str)
            .ok_or(FsError::Fault)?;
        Ok(target.to_owned())
    }

    /// Attributes of a symlink inode, with the mode forced to symlink
    /// semantics.
    pub async fn symlink_attr(&self, inode: u64) -> Result<InodeAttr, FsError> {
        let mut attr = self.getattr(inode).await?;
        attr.mode = libc::S_IFLNK | 0o777;
        Ok(attr)
    }
}
