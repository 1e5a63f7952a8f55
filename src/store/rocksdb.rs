use std::path::Path as FsPath;

use ::rocksdb::{DB, DBCompressionType, Options, WriteBatch};
use tracing::debug;

use crate::chunk::{self, HashChunk};
use crate::error::{Error, Result};
use crate::leaf::{LeafRange, LeafRecord, Serializable};
use crate::path::Path;

use super::HashStore;

const CHUNK_PREFIX: u8 = b'c';
const LEAF_PREFIX: u8 = b'l';
const META_RANGE: &[u8] = b"m:range";
const META_CHUNK_HEIGHT: &[u8] = b"m:height";

/// A [`HashStore`] on RocksDB. Keys are big-endian so that chunks and leaves are laid out in id and
/// path order, which lets stale records be dropped with range deletes.
pub struct RocksDbStore {
  db: DB,
  chunk_height: u32,
}

impl RocksDbStore {
  /// Opens or creates a store. An existing store must have been created with the same chunk height.
  pub fn open<P: AsRef<FsPath>>(path: P, chunk_height: u32) -> Result<Self> {
    chunk::validate_height(chunk_height)?;
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_compression_type(DBCompressionType::None);
    opts.set_compression_per_level(&[DBCompressionType::None; 7]);
    let db = DB::open(&opts, path.as_ref())?;

    match db.get(META_CHUNK_HEIGHT)? {
      Some(bytes) => {
        let stored = bytes.as_slice().try_into().map(u32::from_le_bytes).map_err(|_| {
          Error::InvalidData(format!("corrupted chunk height record in {}", path.as_ref().display()))
        })?;
        if stored != chunk_height {
          return Err(Error::InvalidData(format!("store was created with chunk height {stored}, not {chunk_height}")));
        }
      }
      None => db.put(META_CHUNK_HEIGHT, chunk_height.to_le_bytes())?,
    }
    debug!(target: "vtree::store", path = %path.as_ref().display(), chunk_height, "rocksdb store opened");
    Ok(RocksDbStore { db, chunk_height })
  }
}

fn chunk_key(chunk_id: u64) -> [u8; 9] {
  prefixed(CHUNK_PREFIX, chunk_id)
}

fn leaf_key(path: Path) -> [u8; 9] {
  prefixed(LEAF_PREFIX, path)
}

fn prefixed(prefix: u8, value: u64) -> [u8; 9] {
  let mut key = [prefix; 9];
  key[1..].copy_from_slice(&value.to_be_bytes());
  key
}

impl HashStore for RocksDbStore {
  fn chunk_height(&self) -> u32 {
    self.chunk_height
  }

  fn leaf_range(&self) -> Result<Option<LeafRange>> {
    match self.db.get_pinned(META_RANGE)? {
      Some(bytes) => LeafRange::from_bytes(&bytes).map(Some),
      None => Ok(None),
    }
  }

  fn load_hash_chunk(&self, chunk_id: u64) -> Result<Option<HashChunk>> {
    match self.db.get_pinned(chunk_key(chunk_id))? {
      Some(bytes) => HashChunk::from_bytes(&bytes, self.chunk_height).map(Some),
      None => Ok(None),
    }
  }

  fn load_leaf(&self, path: Path) -> Result<Option<LeafRecord>> {
    match self.db.get_pinned(leaf_key(path))? {
      Some(bytes) => LeafRecord::from_bytes(&bytes).map(Some),
      None => Ok(None),
    }
  }

  fn save_records(
    &self,
    range: Option<LeafRange>,
    chunks: &[HashChunk],
    leaves: &[LeafRecord],
    deleted_leaves: &[LeafRecord],
    full_rehash: bool,
  ) -> Result<()> {
    let mut batch = WriteBatch::default();
    for leaf in deleted_leaves {
      batch.delete(leaf_key(leaf.path));
    }
    for chunk in chunks {
      batch.put(chunk_key(chunk.id()), chunk.to_bytes()?);
    }
    for leaf in leaves {
      batch.put(leaf_key(leaf.path), leaf.to_bytes()?);
    }
    match range {
      Some(range) => batch.put(META_RANGE, range.to_bytes()?),
      None => batch.delete(META_RANGE),
    }
    if full_rehash {
      let (first_stale_leaf, first_stale_chunk) = match range {
        Some(range) => (range.last + 1, chunk::last_chunk_id_for_paths(range.last, self.chunk_height) + 1),
        None => (0, 0),
      };
      batch.delete_range(&leaf_key(first_stale_leaf)[..], &[LEAF_PREFIX + 1][..]);
      batch.delete_range(&chunk_key(first_stale_chunk)[..], &[CHUNK_PREFIX + 1][..]);
    }
    debug!(
      target: "vtree::store",
      chunks = chunks.len(),
      leaves = leaves.len(),
      deleted = deleted_leaves.len(),
      full_rehash,
      "writing batch"
    );
    self.db.write(batch)?;
    Ok(())
  }
}
