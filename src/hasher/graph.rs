use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use parking_lot::Mutex;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::leaf::{LeafRange, LeafRecord};
use crate::path::{self, INVALID_PATH, Path, ROOT_PATH, Rank};

pub(crate) type TaskId = usize;

pub(crate) const ROOT_TASK: TaskId = 0;

/// Hashes one leaf and hands the result to its output chunk task.
pub(crate) struct LeafTask {
  pub record: LeafRecord,
  pub out: TaskId,
}

/// Hashes a sub-tree of `height` ranks below `path`. It has `2^height` inputs at rank
/// `rank(path) + height`. An input is either produced by another task (dynamic) or unchanged since
/// the last pass (clean) and then read from the chunk it is stored in.
pub(crate) struct ChunkTask {
  pub path: Path,
  pub height: u32,
  pub out: Option<TaskId>,
  pub has_clean_inputs: bool,
  // inputs that are known to be dynamic or clean, only used while the graph is built
  initialized: u64,
  // dynamic inputs not delivered yet
  pub pending: AtomicUsize,
  pub failed: AtomicBool,
  pub ins: Mutex<Vec<Option<Digest>>>,
}

impl ChunkTask {
  fn new(path: Path, height: u32, out: Option<TaskId>) -> Self {
    ChunkTask {
      path,
      height,
      out,
      has_clean_inputs: false,
      initialized: 0,
      pending: AtomicUsize::new(0),
      failed: AtomicBool::new(false),
      ins: Mutex::new(vec![None; 1 << height]),
    }
  }

  fn input_count(&self) -> u64 {
    1 << self.height
  }

  pub fn first_input_path(&self) -> Path {
    path::left_grand_child(self.path, self.height)
  }

  pub fn last_input_path(&self) -> Path {
    path::right_grand_child(self.path, self.height)
  }

  fn dynamic_input(&mut self) {
    self.initialized += 1;
    *self.pending.get_mut() += 1;
    debug_assert!(self.initialized <= self.input_count());
  }

  fn clean_inputs(&mut self, n: u64) {
    if n > 0 {
      self.has_clean_inputs = true;
      self.initialized += n;
      debug_assert!(self.initialized <= self.input_count());
    }
  }

  fn no_more_inputs(&mut self) {
    let n = self.input_count() - self.initialized;
    self.clean_inputs(n);
  }

  fn all_inputs_initialized(&self) -> bool {
    self.initialized == self.input_count()
  }
}

/// All tasks of one hashing pass. The root task is always [`ROOT_TASK`].
pub(crate) struct TaskGraph {
  pub leaves: Vec<LeafTask>,
  pub chunks: Vec<ChunkTask>,
}

enum Producer {
  Leaf(TaskId),
  Chunk(TaskId),
}

/// Heights of chunk tasks whose inputs are at `rank`. Tasks are aligned to multiples of the chunk
/// height, except right above the leaf ranks: their height is cut so their inputs land on the first
/// leaf rank, and on the last leaf rank a chunk that would reach past the last leaf is split into
/// tasks of height 1.
pub(crate) fn chunk_height_for_input_rank(
  path: Path,
  rank: Rank,
  first_leaf_rank: Rank,
  last_leaf_rank: Rank,
  last_leaf_path: Path,
  chunk_height: u32,
) -> u32 {
  if rank == last_leaf_rank && first_leaf_rank != last_leaf_rank {
    let height = (rank - 1) % chunk_height + 1;
    let chunk_path = path::grand_parent(path, height);
    if path::right_grand_child(chunk_path, height) <= last_leaf_path { height } else { 1 }
  } else if rank == first_leaf_rank {
    (rank - 1) % chunk_height + 1
  } else {
    debug_assert_eq!(0, rank % chunk_height);
    chunk_height
  }
}

/// Builds the task graph for the dirty leaves, which must be sorted by path without duplicates and
/// within the leaf range.
///
/// Every dirty leaf is walked up to the first ancestor task that already exists. Since leaves come in
/// path order, every input between the last dirty path seen at a rank and the current one is clean,
/// and is marked so in bulk. Inputs no leaf has reached when the walk is over are clean too.
pub(crate) fn build<I>(chunk_height: u32, range: LeafRange, sorted_dirty_leaves: I) -> Result<TaskGraph>
where
  I: IntoIterator<Item = LeafRecord>,
{
  let first_leaf_rank = path::rank(range.first);
  let last_leaf_rank = path::rank(range.last);
  let height_for = |path: Path, rank: Rank| {
    chunk_height_for_input_rank(path, rank, first_leaf_rank, last_leaf_rank, range.last, chunk_height)
  };

  let mut leaves = Vec::new();
  let mut chunks = vec![ChunkTask::new(ROOT_PATH, first_leaf_rank.min(chunk_height), None)];
  // tasks that may still get inputs, by path
  let mut open = HashMap::from([(ROOT_PATH, ROOT_TASK)]);
  // the last path visited at each rank
  let mut frontier = vec![INVALID_PATH; last_leaf_rank as usize + 1];
  frontier[0] = ROOT_PATH;

  let mut previous: Option<Path> = None;
  for record in sorted_dirty_leaves {
    let leaf_path = record.path;
    if !range.contains(leaf_path) || previous.is_some_and(|p| p >= leaf_path) {
      return Err(Error::InvalidLeafPath { path: leaf_path, first: range.first, last: range.last });
    }
    previous = Some(leaf_path);

    leaves.push(LeafTask { record, out: ROOT_TASK });
    let mut producer = Producer::Leaf(leaves.len() - 1);
    let mut cur_path = leaf_path;
    loop {
      let cur_rank = path::rank(cur_path);
      debug_assert!(cur_rank > 0);

      let last_at_rank = frontier[cur_rank as usize];
      if last_at_rank != INVALID_PATH {
        let h = height_for(last_at_rank, cur_rank);
        let parent_path = path::grand_parent(last_at_rank, h);
        let parent = open.get(&parent_path).copied();
        debug_assert!(parent.is_some(), "no open task at {parent_path}");
        if let Some(id) = parent {
          let last_input = chunks[id].last_input_path();
          if cur_path > last_input {
            // the rest of the previous parent is clean
            chunks[id].clean_inputs(last_input - last_at_rank);
            if chunks[id].all_inputs_initialized() {
              open.remove(&parent_path);
            }
          }
        }
      }
      frontier[cur_rank as usize] = cur_path;

      let h = height_for(cur_path, cur_rank);
      let parent_path = path::grand_parent(cur_path, h);
      let (parent, exists) = match open.get(&parent_path) {
        Some(&id) => (id, true),
        None => {
          chunks.push(ChunkTask::new(parent_path, h, None));
          let id = chunks.len() - 1;
          open.insert(parent_path, id);
          (id, false)
        }
      };
      match producer {
        Producer::Leaf(id) => leaves[id].out = parent,
        Producer::Chunk(id) => chunks[id].out = Some(parent),
      }
      let task = &mut chunks[parent];
      task.dynamic_input();

      // clean inputs of this parent between the frontier and the current path
      if last_at_rank != INVALID_PATH {
        let from = task.first_input_path().max(last_at_rank + 1);
        if cur_path > from {
          task.clean_inputs(cur_path - from);
        }
      }

      if exists {
        break;
      }
      cur_path = parent_path;
      producer = Producer::Chunk(parent);
    }
  }

  for id in open.into_values() {
    chunks[id].no_more_inputs();
  }
  Ok(TaskGraph { leaves, chunks })
}
