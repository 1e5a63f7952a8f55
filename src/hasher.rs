use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::ThreadPool;
use tracing::{debug, error};

use crate::chunk;
use crate::config::HasherConfig;
use crate::digest::Digest;
use crate::error::Result;
use crate::leaf::{LeafRange, LeafRecord};
use crate::listener::HashListener;
use crate::path::Path;
use crate::store::ChunkLoader;

pub(crate) mod graph;
mod task;

use task::HashingPass;

/// Computes the root hash of a virtual tree from the leaves changed since the last pass and the
/// chunks of hashes stored for everything else.
///
/// Only the ancestors of dirty leaves are rehashed. Every chunk touched by a pass is handed to the
/// listener once with all of its hashes updated, so the caller can persist it.
///
/// A hasher owns no per-pass state, so one hasher and its pool can serve any number of trees, and
/// passes of different trees may run at the same time.
pub struct VirtualHasher {
  pool: Arc<ThreadPool>,
  shutdown: AtomicBool,
}

impl VirtualHasher {
  pub fn new(pool: Arc<ThreadPool>) -> Self {
    VirtualHasher { pool, shutdown: AtomicBool::new(false) }
  }

  pub fn from_config(config: &HasherConfig) -> Result<Self> {
    Ok(Self::new(Arc::new(config.build_pool()?)))
  }

  pub fn pool(&self) -> &Arc<ThreadPool> {
    &self.pool
  }

  /// Marks this hasher as being torn down. Failures of passes still in flight are then expected, and
  /// are reported to the caller without being logged as errors. Running tasks are not interrupted.
  pub fn shutdown(&self) {
    self.shutdown.store(true, Ordering::Release);
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown.load(Ordering::Acquire)
  }

  /// Hashes the dirty leaves and returns the new root hash, or `None` if there are no dirty leaves.
  ///
  /// `sorted_dirty_leaves` must be sorted by path without duplicates, and every path must be within
  /// `[first_leaf_path, last_leaf_path]`. Clean inputs are read through `loader`.
  ///
  /// # Errors
  ///
  /// `InvalidRange` if there are dirty leaves but the leaf range is invalid, and `InvalidLeafPath` if
  /// the leaves break the order or range requirements; no task runs in either case. Failures inside
  /// tasks are returned as `TaskExecution` and failures of the listener's completion as they are.
  pub fn hash<L, I, H>(
    &self,
    chunk_height: u32,
    loader: &L,
    sorted_dirty_leaves: I,
    first_leaf_path: Path,
    last_leaf_path: Path,
    listener: &H,
  ) -> Result<Option<Digest>>
  where
    L: ChunkLoader + ?Sized,
    I: IntoIterator<Item = LeafRecord>,
    H: HashListener + ?Sized,
  {
    chunk::validate_height(chunk_height)?;
    listener.on_hashing_started(first_leaf_path, last_leaf_path);

    let mut leaves = sorted_dirty_leaves.into_iter().peekable();
    if leaves.peek().is_none() {
      listener.on_hashing_completed()?;
      return Ok(None);
    }
    let range = LeafRange::new(first_leaf_path, last_leaf_path)?;

    let start = Instant::now();
    let graph = graph::build(chunk_height, range, leaves)?;
    let (leaf_tasks, chunk_tasks) = (graph.leaves.len(), graph.chunks.len());
    match HashingPass::new(&graph, loader, listener, chunk_height, range).run(&self.pool) {
      Ok(root) => {
        debug!(
          target: "vtree::hasher",
          leaf_tasks,
          chunk_tasks,
          elapsed_ms = start.elapsed().as_millis() as u64,
          "root hash computed"
        );
        listener.on_hashing_completed()?;
        Ok(Some(root))
      }
      Err(e) => {
        if self.is_shut_down() {
          debug!(target: "vtree::hasher", error = %e, "hashing interrupted by shutdown");
        } else {
          error!(target: "vtree::hasher", error = %e, cause = %e.root_cause(), "failed to hash the virtual tree");
        }
        Err(e)
      }
    }
  }
}
