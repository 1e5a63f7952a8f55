use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::chunk::{ChunkHandle, HashChunk};
use crate::config::HasherConfig;
use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::flush::{FlushStatistics, FullRehashFlushListener};
use crate::hasher::VirtualHasher;
use crate::leaf::{LeafRange, LeafRecord};
use crate::listener::HashListener;
use crate::path::{Path, ROOT_PATH};
use crate::stat::HashingStatistics;
use crate::store::{ChunkLoader, ChunkPreloader, HashStore, MemoryStore};

/// A virtual tree whose leaves and hash chunks live in a [`HashStore`].
///
/// The tree keeps nothing in memory between calls. Each [`VirtualTree::update`] rehashes the changed
/// leaves against the stored chunks and saves the results in one batch.
pub struct VirtualTree<S: HashStore> {
  store: S,
  hasher: Arc<VirtualHasher>,
  flush_threshold: usize,
  full_rehash_buffer: usize,
  statistics: HashingStatistics,
}

impl<S: HashStore> VirtualTree<S> {
  pub fn new(store: S, hasher: Arc<VirtualHasher>, config: &HasherConfig) -> Result<Self> {
    config.validate()?;
    if store.chunk_height() != config.chunk_height {
      return Err(Error::InvalidData(format!(
        "store has chunk height {}, but {} is configured",
        store.chunk_height(),
        config.chunk_height
      )));
    }
    Ok(VirtualTree {
      store,
      hasher,
      flush_threshold: config.flush_threshold,
      full_rehash_buffer: config.full_rehash_buffer,
      statistics: HashingStatistics::new(),
    })
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn statistics(&self) -> &HashingStatistics {
    &self.statistics
  }

  pub fn leaf_range(&self) -> Result<Option<LeafRange>> {
    self.store.leaf_range()
  }

  /// Number of leaves.
  pub fn size(&self) -> Result<u64> {
    Ok(self.store.leaf_range()?.map(|range| range.size()).unwrap_or(0))
  }

  pub fn get(&self, path: Path) -> Result<Option<LeafRecord>> {
    match self.store.leaf_range()? {
      Some(range) if range.contains(path) => self.store.load_leaf(path),
      _ => Ok(None),
    }
  }

  /// Root hash as stored, recomputed from the root chunk.
  pub fn root_hash(&self) -> Result<Digest> {
    let Some(range) = self.store.leaf_range()? else {
      return Ok(digest::empty_root_hash());
    };
    let root_chunk = self.store.load_hash_chunk(0)?.ok_or(Error::ChunkLoad(ROOT_PATH))?;
    root_chunk.chunk_root_hash(range.first, range.last)
  }

  /// Moves the tree to `range`, hashes the dirty leaves and returns the new root hash.
  ///
  /// Every leaf whose path or content changed must be in `dirty_leaves`, in any order. Leaves that
  /// left the tree, or left a path another leaf did not move into, go to `deleted_leaves`. With a
  /// `None` range the tree becomes empty.
  pub fn update(
    &self,
    range: Option<LeafRange>,
    mut dirty_leaves: Vec<LeafRecord>,
    deleted_leaves: Vec<LeafRecord>,
  ) -> Result<Digest> {
    let Some(range) = range else {
      self.store.save_records(None, &[], &[], &deleted_leaves, true)?;
      debug!(target: "vtree::tree", deleted = deleted_leaves.len(), "tree cleared");
      return Ok(digest::empty_root_hash());
    };
    dirty_leaves.sort_unstable_by_key(|leaf| leaf.path);
    let dirty = dirty_leaves.len();

    // a tree that has never been saved has no chunks to read
    let is_new = self.store.leaf_range()?.is_none();
    let loader = ChunkPreloader::new(&self.store).create_missing(is_new);
    let listener = UpdateListener::new(&self.store, &self.statistics, range, deleted_leaves);
    let start = Instant::now();
    let root = self.hasher.hash(self.store.chunk_height(), &loader, dirty_leaves, range.first, range.last, &listener)?;
    match root {
      Some(root) => {
        self.statistics.record_hash(start.elapsed());
        debug!(target: "vtree::tree", dirty, chunks = loader.loaded(), root = %root, "tree updated");
        Ok(root)
      }
      None => self.root_hash(),
    }
  }

  /// Rehashes every leaf if the stored hash of the first leaf no longer matches its content, which
  /// happens when the way leaves are hashed has changed. Returns the new root hash if a rehash ran.
  pub fn full_rehash_if_necessary(&self) -> Result<Option<Digest>> {
    let Some(range) = self.store.leaf_range()? else {
      info!(target: "vtree::tree", "tree is empty, skipping full rehash");
      return Ok(None);
    };
    let leaf = self.store.load_leaf(range.first)?;
    let stored = self.store.load_hash(range.first)?;
    let (Some(leaf), Some(stored)) = (leaf, stored) else {
      error!(target: "vtree::tree", path = range.first, "first leaf or its hash is missing, skipping full rehash");
      return Ok(None);
    };
    if leaf.hash() == stored {
      info!(target: "vtree::tree", "first leaf hash is up to date, skipping full rehash");
      return Ok(None);
    }
    self.full_rehash()
  }

  /// Rehashes every leaf of the tree from the store and rewrites all chunks.
  ///
  /// The task graph holds every leaf of the tree in memory until the root is hashed. The bounded
  /// queue only limits how far the store reader runs ahead of the graph build. Hashed chunks are
  /// saved in batches while the pass runs.
  pub fn full_rehash(&self) -> Result<Option<Digest>> {
    let Some(range) = self.store.leaf_range()? else {
      return Ok(None);
    };
    info!(target: "vtree::tree", first = range.first, last = range.last, "full rehash started");
    let chunk_height = self.store.chunk_height();
    let start = Instant::now();

    // every chunk is rebuilt from scratch, stored chunks are never read
    let scratch = MemoryStore::new(chunk_height)?;
    let preloader = ChunkPreloader::new(&scratch).create_missing(true);
    let aborted = AtomicBool::new(false);
    let loader = |chunk_path: Path| -> Result<Option<ChunkHandle>> {
      // leaves that never arrived look like clean inputs, which must not be hashed from empty chunks
      if aborted.load(Ordering::Acquire) {
        return Err(Error::InvalidData("full rehash aborted".to_string()));
      }
      preloader.load_chunk(chunk_path)
    };
    let listener = FullRehashFlushListener::new(&self.store, &self.statistics, range, self.flush_threshold);

    let (tx, rx) = crossbeam_channel::bounded::<LeafRecord>(self.full_rehash_buffer);
    let (fed, hashed) = std::thread::scope(|s| {
      let (loader, listener) = (&loader, &listener);
      let hashing = s.spawn(move || self.hasher.hash(chunk_height, loader, rx, range.first, range.last, listener));

      let fed = self.feed(range, &tx);
      if fed.is_err() {
        aborted.store(true, Ordering::Release);
      }
      drop(tx);
      let hashed = hashing.join().unwrap_or_else(|_| Err(Error::Panicked("full rehash thread panicked".to_string())));
      (fed, hashed)
    });

    if let Err(e) = fed {
      error!(target: "vtree::tree", error = %e, "full rehash failed to read the leaves");
      return Err(e);
    }
    let root = hashed?;
    self.statistics.record_hash(start.elapsed());
    info!(
      target: "vtree::tree",
      flushes = listener.flushes(),
      elapsed_ms = start.elapsed().as_millis() as u64,
      "full rehash done"
    );
    Ok(root)
  }

  fn feed(&self, range: LeafRange, tx: &crossbeam_channel::Sender<LeafRecord>) -> Result<()> {
    let one_percent = (range.last - range.first) / 100 + 1;
    for path in range.first..=range.last {
      let leaf =
        self.store.load_leaf(path)?.ok_or_else(|| Error::InvalidData(format!("no leaf at path {path}")))?;
      if tx.send(leaf).is_err() {
        // the hasher gave up, its error is reported instead
        warn!(target: "vtree::tree", path, "full rehash stopped feeding leaves");
        return Ok(());
      }
      let offset = path - range.first;
      if offset % one_percent == 0 {
        info!(target: "vtree::tree", percent = offset / one_percent + 1, "full rehash progress");
      }
    }
    Ok(())
  }
}

/// Buffers everything hashed by an update and saves it in one batch when hashing completes.
struct UpdateListener<'a, S: HashStore + ?Sized> {
  store: &'a S,
  statistics: &'a dyn FlushStatistics,
  range: LeafRange,
  deleted_leaves: Vec<LeafRecord>,
  chunks: Mutex<Vec<HashChunk>>,
  leaves: Mutex<Vec<LeafRecord>>,
}

impl<'a, S: HashStore + ?Sized> UpdateListener<'a, S> {
  fn new(store: &'a S, statistics: &'a dyn FlushStatistics, range: LeafRange, deleted_leaves: Vec<LeafRecord>) -> Self {
    UpdateListener {
      store,
      statistics,
      range,
      deleted_leaves,
      chunks: Mutex::new(Vec::new()),
      leaves: Mutex::new(Vec::new()),
    }
  }
}

impl<S: HashStore + ?Sized> HashListener for UpdateListener<'_, S> {
  fn on_leaf_hashed(&self, leaf: &LeafRecord) -> Result<()> {
    self.leaves.lock().push(leaf.clone());
    Ok(())
  }

  fn on_chunk_hashed(&self, chunk: &HashChunk) -> Result<()> {
    self.chunks.lock().push(chunk.clone());
    Ok(())
  }

  fn on_hashing_completed(&self) -> Result<()> {
    let chunks = std::mem::take(&mut *self.chunks.lock());
    let leaves = std::mem::take(&mut *self.leaves.lock());
    let start = Instant::now();
    self
      .store
      .save_records(Some(self.range), &chunks, &leaves, &self.deleted_leaves, false)
      .map_err(|e| Error::IoFlush(Box::new(e)))?;
    self.statistics.record_flush(start.elapsed().as_millis() as u64);
    Ok(())
  }
}
