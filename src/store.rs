use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::chunk::{self, ChunkHandle, HashChunk};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::leaf::{LeafRange, LeafRecord};
use crate::path::Path;

pub mod memory;
pub mod rocksdb;

pub use self::memory::MemoryStore;
pub use self::rocksdb::RocksDbStore;

/// Persistent home of hash chunks and leaf records.
///
/// Chunks are keyed by chunk id, leaves by path. Every store is bound to a single chunk height, since
/// the packed chunk form does not carry it.
pub trait HashStore: Send + Sync {
  fn chunk_height(&self) -> u32;

  /// The current leaf range, or `None` if the tree is empty.
  fn leaf_range(&self) -> Result<Option<LeafRange>>;

  fn load_hash_chunk(&self, chunk_id: u64) -> Result<Option<HashChunk>>;

  fn load_leaf(&self, path: Path) -> Result<Option<LeafRecord>>;

  /// Saves a batch of hashing results atomically.
  ///
  /// Deleted leaves are removed before the given leaves are written, so a leaf that moved into the
  /// path of a deleted one survives. With `full_rehash` set, leaves beyond the last leaf path and
  /// chunks beyond the last chunk needed for the range are dropped as stale.
  fn save_records(
    &self,
    range: Option<LeafRange>,
    chunks: &[HashChunk],
    leaves: &[LeafRecord],
    deleted_leaves: &[LeafRecord],
    full_rehash: bool,
  ) -> Result<()>;

  /// Stored hash of any non-root path.
  fn load_hash(&self, path: Path) -> Result<Option<Digest>> {
    let height = self.chunk_height();
    match self.load_hash_chunk(chunk::path_to_chunk_id(path, height))? {
      Some(chunk) => chunk.get_hash_at_path(path).map(Some),
      None => Ok(None),
    }
  }
}

/// Source of chunks for a hashing pass.
///
/// For a given chunk path, every call within one pass must return the same handle, so that hashes
/// updated by one task are seen by all other tasks working in the same chunk.
pub trait ChunkLoader: Sync {
  fn load_chunk(&self, chunk_path: Path) -> Result<Option<ChunkHandle>>;
}

impl<F> ChunkLoader for F
where
  F: Fn(Path) -> Result<Option<ChunkHandle>> + Sync,
{
  fn load_chunk(&self, chunk_path: Path) -> Result<Option<ChunkHandle>> {
    self(chunk_path)
  }
}

/// A [`ChunkLoader`] over a [`HashStore`] that keeps every chunk it has handed out. Each chunk is
/// read from the store at most once, and the arena is released when the preloader is dropped at the
/// end of the pass.
pub struct ChunkPreloader<'a, S: HashStore + ?Sized> {
  store: &'a S,
  height: u32,
  create_missing: bool,
  chunks: Mutex<HashMap<Path, ChunkHandle>>,
}

impl<'a, S: HashStore + ?Sized> ChunkPreloader<'a, S> {
  pub fn new(store: &'a S) -> Self {
    let height = store.chunk_height();
    ChunkPreloader { store, height, create_missing: false, chunks: Mutex::new(HashMap::new()) }
  }

  /// Hands out empty chunks for chunks the store has never seen instead of reporting them missing.
  /// Used when the whole tree is rebuilt from its leaves.
  pub fn create_missing(mut self, create_missing: bool) -> Self {
    self.create_missing = create_missing;
    self
  }

  pub fn loaded(&self) -> usize {
    self.chunks.lock().len()
  }
}

impl<S: HashStore + ?Sized> ChunkLoader for ChunkPreloader<'_, S> {
  fn load_chunk(&self, chunk_path: Path) -> Result<Option<ChunkHandle>> {
    if let Some(handle) = self.chunks.lock().get(&chunk_path) {
      return Ok(Some(handle.clone()));
    }

    // the arena lock is not held during I/O; a concurrent load of the same chunk keeps the first
    let chunk_id = chunk::chunk_path_to_chunk_id(chunk_path, self.height);
    let chunk = match self.store.load_hash_chunk(chunk_id)? {
      Some(chunk) if chunk.path() != chunk_path => {
        return Err(Error::InvalidData(format!(
          "chunk {chunk_id} was expected at path {chunk_path}, but found at {}",
          chunk.path()
        )));
      }
      Some(chunk) => chunk,
      None if self.create_missing => HashChunk::new(chunk_path, self.height)?,
      None => return Ok(None),
    };
    trace!(target: "vtree::store", chunk_path, chunk_id, "chunk loaded");
    let handle = self.chunks.lock().entry(chunk_path).or_insert_with(|| chunk.into_handle()).clone();
    Ok(Some(handle))
  }
}
