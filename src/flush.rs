use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::chunk::HashChunk;
use crate::error::{Error, Result};
use crate::leaf::{LeafRange, LeafRecord};
use crate::listener::HashListener;
use crate::path::Path;
use crate::store::HashStore;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 500_000;

/// Sink for flush durations.
pub trait FlushStatistics: Sync {
  fn record_flush(&self, millis: u64);
}

#[derive(Default)]
struct Buffers {
  started: bool,
  chunks: Vec<HashChunk>,
  leaves: Vec<LeafRecord>,
}

/// A [`HashListener`] for rehashing a whole tree, which may be too large to keep every hashed chunk
/// in memory until the end of the pass.
///
/// Hashed chunks and leaves are buffered. Once `flush_threshold` chunks have piled up, the buffers
/// are handed to the store in one batch while hashing goes on. At most one flush runs at a time; a
/// chunk arriving while a flush runs is just buffered. Completion flushes whatever is left, even
/// nothing, so the store drops stale records in any case.
pub struct FullRehashFlushListener<'a, S: HashStore + ?Sized> {
  store: &'a S,
  statistics: &'a dyn FlushStatistics,
  range: LeafRange,
  flush_threshold: usize,
  buffers: Mutex<Buffers>,
  flush_in_progress: AtomicBool,
  flushes: AtomicUsize,
}

/// Releases the in-progress flag when a flush ends, whether it succeeded or not.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<'a, S: HashStore + ?Sized> FullRehashFlushListener<'a, S> {
  pub fn new(store: &'a S, statistics: &'a dyn FlushStatistics, range: LeafRange, flush_threshold: usize) -> Self {
    FullRehashFlushListener {
      store,
      statistics,
      range,
      flush_threshold: flush_threshold.max(1),
      buffers: Mutex::new(Buffers::default()),
      flush_in_progress: AtomicBool::new(false),
      flushes: AtomicUsize::new(0),
    }
  }

  /// Number of flushes done so far, including the final one.
  pub fn flushes(&self) -> usize {
    self.flushes.load(Ordering::Acquire)
  }

  fn try_claim_flush(&self) -> bool {
    self.flush_in_progress.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
  }

  fn flush(&self, chunks: Vec<HashChunk>, leaves: Vec<LeafRecord>) -> Result<()> {
    let _guard = FlushGuard(&self.flush_in_progress);
    debug_assert!(self.flush_in_progress.load(Ordering::Acquire));
    let start = Instant::now();
    self
      .store
      .save_records(Some(self.range), &chunks, &leaves, &[], true)
      .map_err(|e| Error::IoFlush(Box::new(e)))?;
    let millis = start.elapsed().as_millis() as u64;
    self.statistics.record_flush(millis);
    let n = self.flushes.fetch_add(1, Ordering::AcqRel) + 1;
    debug!(target: "vtree::flush", flush = n, chunks = chunks.len(), leaves = leaves.len(), millis, "flushed");
    Ok(())
  }
}

impl<S: HashStore + ?Sized> HashListener for FullRehashFlushListener<'_, S> {
  fn on_hashing_started(&self, first_leaf_path: Path, last_leaf_path: Path) {
    let mut buffers = self.buffers.lock();
    debug_assert!(!buffers.started, "full rehash listener started twice");
    debug_assert_eq!((self.range.first, self.range.last), (first_leaf_path, last_leaf_path));
    *buffers = Buffers { started: true, ..Buffers::default() };
  }

  fn on_leaf_hashed(&self, leaf: &LeafRecord) -> Result<()> {
    self.buffers.lock().leaves.push(leaf.clone());
    Ok(())
  }

  fn on_chunk_hashed(&self, chunk: &HashChunk) -> Result<()> {
    let batch = {
      let mut buffers = self.buffers.lock();
      buffers.chunks.push(chunk.clone());
      if buffers.chunks.len() >= self.flush_threshold && self.try_claim_flush() {
        Some((std::mem::take(&mut buffers.chunks), std::mem::take(&mut buffers.leaves)))
      } else {
        None
      }
    };
    // the store is written without holding the buffers
    match batch {
      Some((chunks, leaves)) => self.flush(chunks, leaves),
      None => Ok(()),
    }
  }

  fn on_hashing_completed(&self) -> Result<()> {
    let (chunks, leaves) = {
      let mut buffers = self.buffers.lock();
      debug_assert!(buffers.started, "full rehash listener completed before it started");
      buffers.started = false;
      (std::mem::take(&mut buffers.chunks), std::mem::take(&mut buffers.leaves))
    };
    let claimed = self.try_claim_flush();
    debug_assert!(claimed, "a flush is still in progress at completion");
    self.flush(chunks, leaves)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicU64;
  use std::time::Duration;

  use super::*;
  use crate::store::MemoryStore;

  #[derive(Default)]
  struct Statistics {
    flushes: AtomicU64,
  }

  impl FlushStatistics for Statistics {
    fn record_flush(&self, _millis: u64) {
      self.flushes.fetch_add(1, Ordering::SeqCst);
    }
  }

  /// Records batch sizes and fails if two saves ever overlap.
  #[derive(Default)]
  struct SlowStore {
    saving: AtomicBool,
    batches: Mutex<Vec<(usize, usize)>>,
    fail: bool,
  }

  impl HashStore for SlowStore {
    fn chunk_height(&self) -> u32 {
      2
    }

    fn leaf_range(&self) -> Result<Option<LeafRange>> {
      Ok(None)
    }

    fn load_hash_chunk(&self, _chunk_id: u64) -> Result<Option<HashChunk>> {
      Ok(None)
    }

    fn load_leaf(&self, _path: Path) -> Result<Option<LeafRecord>> {
      Ok(None)
    }

    fn save_records(
      &self,
      _range: Option<LeafRange>,
      chunks: &[HashChunk],
      leaves: &[LeafRecord],
      _deleted_leaves: &[LeafRecord],
      full_rehash: bool,
    ) -> Result<()> {
      assert!(full_rehash);
      assert!(!self.saving.swap(true, Ordering::SeqCst), "overlapping flushes");
      std::thread::sleep(Duration::from_millis(2));
      self.batches.lock().push((chunks.len(), leaves.len()));
      self.saving.store(false, Ordering::SeqCst);
      if self.fail { Err(Error::InvalidData("disk full".to_string())) } else { Ok(()) }
    }
  }

  fn chunk(i: u64) -> HashChunk {
    HashChunk::new(crate::chunk::chunk_id_to_chunk_path(i, 2), 2).unwrap()
  }

  fn leaf(i: u64) -> LeafRecord {
    LeafRecord::new(i + 1, i.to_le_bytes().to_vec(), vec![])
  }

  #[test]
  fn flushes_at_threshold_and_on_completion() {
    let store = SlowStore::default();
    let statistics = Statistics::default();
    let range = LeafRange::for_size(100).unwrap();
    let listener = FullRehashFlushListener::new(&store, &statistics, range, 10);
    listener.on_hashing_started(range.first, range.last);
    for i in 0..31 {
      listener.on_leaf_hashed(&leaf(i)).unwrap();
      listener.on_chunk_hashed(&chunk(i)).unwrap();
    }
    assert_eq!(3, listener.flushes());
    listener.on_hashing_completed().unwrap();
    assert_eq!(4, listener.flushes());
    assert_eq!(4, statistics.flushes.load(Ordering::SeqCst));
    assert_eq!(vec![(10, 10), (10, 10), (10, 10), (1, 1)], *store.batches.lock());
  }

  #[test]
  fn completion_flushes_even_when_empty() {
    let store = SlowStore::default();
    let statistics = Statistics::default();
    let range = LeafRange::for_size(4).unwrap();
    let listener = FullRehashFlushListener::new(&store, &statistics, range, 10);
    listener.on_hashing_started(range.first, range.last);
    for i in 0..10 {
      listener.on_chunk_hashed(&chunk(i)).unwrap();
    }
    listener.on_hashing_completed().unwrap();
    assert_eq!(vec![(10, 0), (0, 0)], *store.batches.lock());
  }

  #[test]
  fn concurrent_callbacks_never_overlap_flushes() {
    let store = SlowStore::default();
    let statistics = Statistics::default();
    let range = LeafRange::for_size(1000).unwrap();
    let threshold = 50;
    let listener = FullRehashFlushListener::new(&store, &statistics, range, threshold);
    listener.on_hashing_started(range.first, range.last);
    std::thread::scope(|s| {
      for t in 0..8u64 {
        let listener = &listener;
        s.spawn(move || {
          for i in 0..500 {
            listener.on_leaf_hashed(&leaf(t * 500 + i)).unwrap();
            listener.on_chunk_hashed(&chunk(t * 500 + i)).unwrap();
          }
        });
      }
    });
    listener.on_hashing_completed().unwrap();

    // chunks that arrive during a flush wait for the next one, so batches may exceed the threshold
    let batches = store.batches.lock();
    assert_eq!(4000, batches.iter().map(|(c, _)| c).sum::<usize>());
    assert_eq!(4000, batches.iter().map(|(_, l)| l).sum::<usize>());
    assert!(batches[..batches.len() - 1].iter().all(|(c, _)| *c >= threshold));
    assert!(batches.len() <= 4000 / threshold + 1);
    assert_eq!(batches.len(), listener.flushes());
  }

  #[test]
  fn flush_errors_release_the_guard() {
    let store = SlowStore { fail: true, ..SlowStore::default() };
    let statistics = Statistics::default();
    let range = LeafRange::for_size(10).unwrap();
    let listener = FullRehashFlushListener::new(&store, &statistics, range, 2);
    listener.on_hashing_started(range.first, range.last);
    listener.on_chunk_hashed(&chunk(0)).unwrap();
    let result = listener.on_chunk_hashed(&chunk(1));
    assert!(matches!(result, Err(Error::IoFlush(_))));
    assert!(!listener.flush_in_progress.load(Ordering::SeqCst));
    assert_eq!(0, statistics.flushes.load(Ordering::SeqCst));
    assert!(matches!(listener.on_hashing_completed(), Err(Error::IoFlush(_))));
  }

  #[test]
  fn rebuilds_a_memory_store() {
    let store = MemoryStore::new(2).unwrap();
    let statistics = Statistics::default();
    let range = LeafRange::for_size(3).unwrap();
    let listener = FullRehashFlushListener::new(&store, &statistics, range, DEFAULT_FLUSH_THRESHOLD);
    listener.on_hashing_started(range.first, range.last);
    for path in range.first..=range.last {
      listener.on_leaf_hashed(&LeafRecord::new(path, vec![path as u8], vec![])).unwrap();
    }
    listener.on_chunk_hashed(&chunk(0)).unwrap();
    listener.on_hashing_completed().unwrap();
    assert_eq!(1, listener.flushes());
    assert_eq!(3, store.leaf_count());
    assert_eq!(1, store.chunk_count());
    assert_eq!(Some(range), store.leaf_range().unwrap());
  }
}
