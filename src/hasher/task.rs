use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rayon::{Scope, ThreadPool};
use tracing::trace;

use crate::chunk::{ChunkHandle, HashChunk};
use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::leaf::LeafRange;
use crate::listener::HashListener;
use crate::path::{self, Path};
use crate::store::ChunkLoader;

use super::graph::{ChunkTask, LeafTask, TaskGraph, TaskId};

/// Executes a [`TaskGraph`] on a worker pool.
///
/// Completion is pushed: a finished task stores its hash in the input slot of its output task and
/// counts down the pending inputs there; the task that delivers the last input spawns the output
/// task. The first failure of any input fails the output task, which passes the error upwards
/// without running.
pub(crate) struct HashingPass<'a, L: ChunkLoader + ?Sized, H: HashListener + ?Sized> {
  graph: &'a TaskGraph,
  loader: &'a L,
  listener: &'a H,
  chunk_height: u32,
  range: LeafRange,
  result: Mutex<Option<Result<Digest>>>,
}

impl<'a, L: ChunkLoader + ?Sized, H: HashListener + ?Sized> HashingPass<'a, L, H> {
  pub fn new(graph: &'a TaskGraph, loader: &'a L, listener: &'a H, chunk_height: u32, range: LeafRange) -> Self {
    HashingPass { graph, loader, listener, chunk_height, range, result: Mutex::new(None) }
  }

  /// Runs all tasks and blocks until the root task has completed.
  pub fn run(self, pool: &ThreadPool) -> Result<Digest> {
    pool.scope(|scope| {
      for leaf in &self.graph.leaves {
        let pass = &self;
        scope.spawn(move |scope| pass.run_leaf(scope, leaf));
      }
    });
    self
      .result
      .into_inner()
      .unwrap_or_else(|| Err(Error::InvalidData("hashing finished without a root hash".to_string())))
  }

  fn run_leaf<'s>(&'s self, scope: &Scope<'s>, task: &'s LeafTask) {
    let result = guarded(|| {
      let hash = task.record.hash();
      self.listener.on_leaf_hashed(&task.record)?;
      Ok(hash)
    });
    let result = result.map_err(|e| Error::TaskExecution { path: task.record.path, source: Box::new(e) });
    self.deliver(scope, task.out, task.record.path, result);
  }

  fn run_chunk<'s>(&'s self, scope: &Scope<'s>, id: TaskId) {
    let task = &self.graph.chunks[id];
    let result = guarded(|| self.hash_chunk(task));
    let result = result.map_err(|e| Error::TaskExecution { path: task.path, source: Box::new(e) });
    self.complete(scope, task, result);
  }

  fn complete<'s>(&'s self, scope: &Scope<'s>, task: &'s ChunkTask, result: Result<Digest>) {
    match task.out {
      Some(out) => self.deliver(scope, out, task.path, result),
      None => *self.result.lock() = Some(result),
    }
  }

  fn deliver<'s>(&'s self, scope: &Scope<'s>, to: TaskId, from_path: Path, result: Result<Digest>) {
    let task = &self.graph.chunks[to];
    match result {
      Ok(hash) => {
        let index = (from_path - task.first_input_path()) as usize;
        task.ins.lock()[index] = Some(hash);
      }
      Err(e) => {
        // only the first failure is passed on, the task never runs
        if !task.failed.swap(true, Ordering::AcqRel) {
          self.complete(scope, task, Err(e));
        }
        return;
      }
    }
    if task.pending.fetch_sub(1, Ordering::AcqRel) == 1 && !task.failed.load(Ordering::Acquire) {
      scope.spawn(move |scope| self.run_chunk(scope, to));
    }
  }

  fn hash_chunk(&self, task: &ChunkTask) -> Result<Digest> {
    let chunk_height = self.chunk_height;
    let (first, last) = (self.range.first, self.range.last);
    let task_rank = path::rank(task.path);
    let rank_dif = task_rank % chunk_height;
    let chunk_path = if rank_dif == 0 { task.path } else { path::grand_parent(task.path, rank_dif) };
    let first_input = task.first_input_path();
    let mut ins = std::mem::take(&mut *task.ins.lock());

    // the missing second child of a single-leaf tree is never read from a chunk
    let needs_stored = task.has_clean_inputs
      && ins.iter().enumerate().any(|(i, hash)| hash.is_none() && first_input + i as u64 <= last);
    let all_at_chunk_rank = task.height == chunk_height || first_input >= first;
    let handle = if chunk_path == task.path && !needs_stored && all_at_chunk_rank {
      // every input is known, nothing needs to be read
      HashChunk::new(chunk_path, chunk_height)?.into_handle()
    } else {
      self.load_chunk(chunk_path)?
    };
    let mut chunk = handle.lock();

    let chunk_last_rank = path::rank(chunk_path) + chunk_height;
    let mut rank_path = first_input;
    let mut current_rank = task_rank + task.height;
    let mut len = ins.len();
    while len > 1 {
      for i in 0..len / 2 {
        let left_path = rank_path + 2 * i as u64;
        let right_path = left_path + 1;
        let left = self.resolve(task, &mut chunk, ins[2 * i], left_path, current_rank, chunk_last_rank)?;
        let left = left.ok_or_else(|| Error::InvalidData(format!("no hash at path {left_path}")))?;
        let right = self.resolve(task, &mut chunk, ins[2 * i + 1], right_path, current_rank, chunk_last_rank)?;
        ins[i] = Some(digest::hash_internal(&left, right.as_ref()));
      }
      rank_path = path::parent(rank_path);
      current_rank -= 1;
      len >>= 1;
    }

    // the task at the chunk path is the last one to touch the chunk
    if task.path == chunk_path {
      self.listener.on_chunk_hashed(&chunk)?;
    }
    trace!(target: "vtree::hasher", path = task.path, height = task.height, "chunk task done");
    ins[0].ok_or_else(|| Error::InvalidData(format!("no hash computed for path {}", task.path)))
  }

  /// Returns the hash of an input slot: a computed hash is written to the chunk where the chunk keeps
  /// it, a clean one is read from the chunk. A path beyond the last leaf has no hash at all.
  fn resolve(
    &self,
    task: &ChunkTask,
    chunk: &mut HashChunk,
    hash: Option<Digest>,
    path: Path,
    current_rank: u32,
    chunk_last_rank: u32,
  ) -> Result<Option<Digest>> {
    let (first, last) = (self.range.first, self.range.last);
    if path > last {
      debug_assert_eq!(2, path);
      return Ok(None);
    }
    let is_leaf = path >= first;
    match hash {
      None if task.height == self.chunk_height || is_leaf => chunk.get_hash_at_path(path).map(Some),
      None => chunk.calc_hash(path, first, last).map(Some),
      Some(hash) => {
        if current_rank == chunk_last_rank || is_leaf {
          chunk.set_hash_at_path(path, &hash)?;
        }
        Ok(Some(hash))
      }
    }
  }

  fn load_chunk(&self, chunk_path: Path) -> Result<ChunkHandle> {
    let handle = self.loader.load_chunk(chunk_path)?.ok_or(Error::ChunkLoad(chunk_path))?;
    let actual = handle.lock().path();
    if actual != chunk_path {
      return Err(Error::InvalidData(format!("chunk loaded for path {chunk_path} is at path {actual}")));
    }
    Ok(handle)
  }
}

/// Runs a task body, turning a panic into an error.
fn guarded<T, F: FnOnce() -> Result<T>>(f: F) -> Result<T> {
  panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  match payload.downcast::<String>() {
    Ok(message) => *message,
    Err(payload) => match payload.downcast::<&'static str>() {
      Ok(message) => message.to_string(),
      Err(_) => "unknown panic".to_string(),
    },
  }
}
