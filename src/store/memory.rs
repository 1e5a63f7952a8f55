use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::chunk::{self, HashChunk};
use crate::error::Result;
use crate::leaf::{LeafRange, LeafRecord};
use crate::path::Path;

use super::HashStore;

#[derive(Default)]
struct Records {
  // chunks are kept in their packed form, as any persistent store would
  chunks: HashMap<u64, Vec<u8>>,
  leaves: BTreeMap<Path, LeafRecord>,
  range: Option<LeafRange>,
}

/// A [`HashStore`] on memory. Clones share the same records.
#[derive(Clone)]
pub struct MemoryStore {
  chunk_height: u32,
  records: Arc<RwLock<Records>>,
}

impl MemoryStore {
  pub fn new(chunk_height: u32) -> Result<Self> {
    chunk::validate_height(chunk_height)?;
    Ok(MemoryStore { chunk_height, records: Default::default() })
  }

  pub fn chunk_count(&self) -> usize {
    self.records.read().chunks.len()
  }

  pub fn leaf_count(&self) -> usize {
    self.records.read().leaves.len()
  }

  pub fn max_chunk_id(&self) -> Option<u64> {
    self.records.read().chunks.keys().max().copied()
  }
}

impl HashStore for MemoryStore {
  fn chunk_height(&self) -> u32 {
    self.chunk_height
  }

  fn leaf_range(&self) -> Result<Option<LeafRange>> {
    Ok(self.records.read().range)
  }

  fn load_hash_chunk(&self, chunk_id: u64) -> Result<Option<HashChunk>> {
    let records = self.records.read();
    match records.chunks.get(&chunk_id) {
      Some(bytes) => HashChunk::from_bytes(bytes, self.chunk_height).map(Some),
      None => Ok(None),
    }
  }

  fn load_leaf(&self, path: Path) -> Result<Option<LeafRecord>> {
    Ok(self.records.read().leaves.get(&path).cloned())
  }

  fn save_records(
    &self,
    range: Option<LeafRange>,
    chunks: &[HashChunk],
    leaves: &[LeafRecord],
    deleted_leaves: &[LeafRecord],
    full_rehash: bool,
  ) -> Result<()> {
    // serialize before taking the lock
    let packed = chunks.iter().map(|c| Ok((c.id(), c.to_bytes()?))).collect::<Result<Vec<_>>>()?;

    let mut records = self.records.write();
    for leaf in deleted_leaves {
      records.leaves.remove(&leaf.path);
    }
    records.chunks.extend(packed);
    for leaf in leaves {
      records.leaves.insert(leaf.path, leaf.clone());
    }
    records.range = range;
    if full_rehash {
      match range {
        Some(range) => {
          let last_chunk_id = chunk::last_chunk_id_for_paths(range.last, self.chunk_height);
          records.leaves.split_off(&(range.last + 1));
          records.chunks.retain(|id, _| *id <= last_chunk_id);
        }
        None => {
          records.leaves.clear();
          records.chunks.clear();
        }
      }
    }
    Ok(())
  }
}
