//! The block store: creation, sharing, and reloading of block files

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_core::{Sample, SampleFormat};

use crate::{
    AliasBlockFile, BlockHandle, OnDemandAliasBlockFile, OnDemandDecodeBlockFile, SilentBlockFile,
    SimpleBlockFile, StoreError, StoreResult,
};

/// The contract the sequence layer requires from its block store.
///
/// Creation methods may fail with `Io`; handles returned from them carry no
/// commitments until the caller publishes them in a committed block list.
pub trait BlockStore: Send + Sync {
    /// Write `samples` to a new project-local block file
    fn new_simple_block(
        &self,
        samples: &[Sample],
        format: SampleFormat,
    ) -> StoreResult<BlockHandle>;

    /// Zero-storage block of implicit zeros
    fn new_silent_block(&self, len: usize) -> BlockHandle;

    /// Block referencing a channel of an external WAV file
    fn new_alias_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
    ) -> StoreResult<BlockHandle>;

    /// Alias block whose summary a background task computes later
    fn new_on_demand_alias_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
    ) -> StoreResult<BlockHandle>;

    /// Block whose samples a background decode materialises later
    fn new_on_demand_decode_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
        decode_type: u16,
    ) -> StoreResult<BlockHandle>;

    /// Share a block. Bumps the reference count, unless the block is locked
    /// into a saved project, in which case its data is physically duplicated
    /// so the projects stop sharing storage.
    fn copy_block(&self, block: &BlockHandle) -> StoreResult<BlockHandle>;

    /// Reconstruct a block file from its persisted descriptor element.
    /// `Ok(None)` means the tag is not a block-file element.
    fn load_block_xml(
        &self,
        tag: &str,
        attrs: &[(String, String)],
    ) -> StoreResult<Option<BlockHandle>>;
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory block files are created in
    pub data_dir: PathBuf,
    /// File prefix, e.g. "b" -> "b00000042.sb"
    pub file_prefix: String,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            file_prefix: "b".to_string(),
        }
    }
}

/// Production block store writing `.sb` files into a project data directory
pub struct DiskBlockStore {
    config: StoreConfig,
    next_id: AtomicU64,
}

impl DiskBlockStore {
    /// Open (or create) the data directory. Numbering continues after any
    /// block files already present so reloads never collide with them.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut max_id = 0u64;
        for entry in std::fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = parse_block_id(name, &config.file_prefix) {
                    max_id = max_id.max(id + 1);
                }
            }
        }

        Ok(Self {
            config,
            next_id: AtomicU64::new(max_id),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn next_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.config
            .data_dir
            .join(format!("{}{:08}.sb", self.config.file_prefix, id))
    }
}

impl BlockStore for DiskBlockStore {
    fn new_simple_block(
        &self,
        samples: &[Sample],
        format: SampleFormat,
    ) -> StoreResult<BlockHandle> {
        let block = SimpleBlockFile::create(self.next_path(), samples, format)?;
        Ok(block)
    }

    fn new_silent_block(&self, len: usize) -> BlockHandle {
        SilentBlockFile::new(len)
    }

    fn new_alias_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
    ) -> StoreResult<BlockHandle> {
        Ok(AliasBlockFile::new(path.to_path_buf(), offset, len, channel)?)
    }

    fn new_on_demand_alias_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
    ) -> StoreResult<BlockHandle> {
        Ok(OnDemandAliasBlockFile::new(
            path.to_path_buf(),
            offset,
            len,
            channel,
        ))
    }

    fn new_on_demand_decode_block(
        &self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
        decode_type: u16,
    ) -> StoreResult<BlockHandle> {
        Ok(OnDemandDecodeBlockFile::new(
            path.to_path_buf(),
            offset,
            len,
            channel,
            decode_type,
        ))
    }

    fn copy_block(&self, block: &BlockHandle) -> StoreResult<BlockHandle> {
        // Locked project-local data must be physically duplicated so an edit
        // in one project cannot strand another project's saved file. Alias
        // and silent blocks own no project-local storage, so sharing the
        // handle is always safe for them.
        if block.is_locked() && !block.is_alias() && block.storage_bytes() > 0 {
            log::debug!("duplicating locked block file {}", block.display_name());
            let format = block.storage_format().unwrap_or(SampleFormat::Float);
            let mut samples = vec![0.0; block.len()];
            block.read(&mut samples, 0, true)?;
            return self.new_simple_block(&samples, format);
        }
        Ok(Arc::clone(block))
    }

    fn load_block_xml(
        &self,
        tag: &str,
        attrs: &[(String, String)],
    ) -> StoreResult<Option<BlockHandle>> {
        match tag {
            "simpleblockfile" => {
                let name = require_attr(attrs, "filename")?;
                if !is_safe_file_name(name) {
                    return Err(StoreError::InvalidAttr {
                        name: "filename".to_string(),
                        value: name.to_string(),
                    });
                }
                let block = SimpleBlockFile::open(self.config.data_dir.join(name))?;
                Ok(Some(block))
            }
            "silentblockfile" => {
                let len = require_usize(attrs, "len")?;
                Ok(Some(SilentBlockFile::new(len)))
            }
            "aliasblockfile" => {
                let path = PathBuf::from(require_attr(attrs, "path")?);
                let offset = require_u64(attrs, "offset")?;
                let len = require_usize(attrs, "len")?;
                let channel = require_u64(attrs, "channel")? as u16;
                Ok(Some(AliasBlockFile::new(path, offset, len, channel)?))
            }
            "odaliasblockfile" => {
                let path = PathBuf::from(require_attr(attrs, "path")?);
                let offset = require_u64(attrs, "offset")?;
                let len = require_usize(attrs, "len")?;
                let channel = require_u64(attrs, "channel")? as u16;
                Ok(Some(OnDemandAliasBlockFile::new(path, offset, len, channel)))
            }
            "oddecodeblockfile" => {
                let path = PathBuf::from(require_attr(attrs, "path")?);
                let offset = require_u64(attrs, "offset")?;
                let len = require_usize(attrs, "len")?;
                let channel = require_u64(attrs, "channel")? as u16;
                let decode_type = require_u64(attrs, "decodetype")? as u16;
                Ok(Some(OnDemandDecodeBlockFile::new(
                    path,
                    offset,
                    len,
                    channel,
                    decode_type,
                )))
            }
            _ => Ok(None),
        }
    }
}

fn parse_block_id(file_name: &str, prefix: &str) -> Option<u64> {
    file_name
        .strip_prefix(prefix)?
        .strip_suffix(".sb")?
        .parse()
        .ok()
}

/// Reject descriptor file names that could escape the data directory
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn find_attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn require_attr<'a>(attrs: &'a [(String, String)], name: &str) -> StoreResult<&'a str> {
    find_attr(attrs, name).ok_or_else(|| StoreError::MissingAttr(name.to_string()))
}

fn require_u64(attrs: &[(String, String)], name: &str) -> StoreResult<u64> {
    let value = require_attr(attrs, name)?;
    value.parse().map_err(|_| StoreError::InvalidAttr {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn require_usize(attrs: &[(String, String)], name: &str) -> StoreResult<usize> {
    Ok(require_u64(attrs, name)? as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_and_reload_simple_block() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();

        let samples: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let block = store
            .new_simple_block(&samples, SampleFormat::Float)
            .unwrap();
        block.lock();

        let mut w = strata_core::XmlWriter::new();
        block.write_xml(&mut w);
        let xml = w.finish();
        assert!(xml.contains("simpleblockfile"));

        // Pull the filename back out and reload through the store
        let name = xml
            .split("filename=\"")
            .nth(1)
            .unwrap()
            .split('"')
            .next()
            .unwrap()
            .to_string();
        let reloaded = store
            .load_block_xml("simpleblockfile", &attrs(&[("filename", &name), ("len", "100")]))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.len(), 100);
    }

    #[test]
    fn test_copy_block_shares_unlocked() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let block = store
            .new_simple_block(&[0.5; 64], SampleFormat::Float)
            .unwrap();

        let copy = store.copy_block(&block).unwrap();
        assert_eq!(Arc::strong_count(&block), 2);
        assert_eq!(copy.len(), 64);
    }

    #[test]
    fn test_copy_block_duplicates_locked() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let block = store
            .new_simple_block(&[0.5; 64], SampleFormat::Float)
            .unwrap();
        block.lock();

        let copy = store.copy_block(&block).unwrap();
        // A genuinely new file, not a refcount bump
        assert_eq!(Arc::strong_count(&block), 1);
        let mut out = vec![0.0; 64];
        copy.read(&mut out, 0, true).unwrap();
        assert_eq!(out, vec![0.5; 64]);
    }

    #[test]
    fn test_copy_block_shares_silent_even_locked() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let silent = store.new_silent_block(1000);
        silent.lock();
        let copy = store.copy_block(&silent).unwrap();
        assert_eq!(copy.storage_bytes(), 0);
    }

    #[test]
    fn test_numbering_continues_after_reopen() {
        let dir = tempdir().unwrap();
        let path_of_first;
        {
            let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
            let b = store
                .new_simple_block(&[0.0; 8], SampleFormat::Float)
                .unwrap();
            b.lock();
            path_of_first = b.display_name();
        }
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let b2 = store
            .new_simple_block(&[0.0; 8], SampleFormat::Float)
            .unwrap();
        assert_ne!(b2.display_name(), path_of_first);
    }

    #[test]
    fn test_load_block_xml_unknown_tag() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        assert!(store
            .load_block_xml("envelope", &attrs(&[]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_block_xml_missing_file() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let result = store.load_block_xml(
            "simpleblockfile",
            &attrs(&[("filename", "b99999999.sb"), ("len", "100")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_block_xml_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let result = store.load_block_xml(
            "simpleblockfile",
            &attrs(&[("filename", "../../etc/passwd"), ("len", "1")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_silent_block() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let block = store
            .load_block_xml("silentblockfile", &attrs(&[("len", "4096")]))
            .unwrap()
            .unwrap();
        assert_eq!(block.len(), 4096);
        assert_eq!(block.storage_bytes(), 0);
    }
}
