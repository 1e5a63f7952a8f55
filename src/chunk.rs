use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::digest::{self, DIGEST_SIZE, Digest};
use crate::error::{Error, Result};
use crate::path::{self, Path, Rank};

pub const MAX_CHUNK_HEIGHT: u32 = 16;

/// Shared handle to a chunk. Every task touching the same chunk during one hashing pass holds the
/// same handle, so hashes written by one task are visible to the others.
pub type ChunkHandle = Arc<Mutex<HashChunk>>;

/// A set of hashes in a sub-tree of the virtual tree, stored and loaded as a single unit.
///
/// A chunk is identified by its path, which is the parent of its two top-most hashes. The chunk at
/// path 0 with height 2 holds the hashes of paths 1 to 6. Only the hashes at the last chunk rank are
/// kept; a hash at an internal rank is kept at the slot of its left-most grand child at the last rank,
/// which is only meaningful when that internal path is a leaf. Other internal hashes are recomputed
/// on demand with [`HashChunk::calc_hash`].
///
/// The hash at the chunk path itself belongs to the parent chunk, except the root hash which belongs
/// to no chunk at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChunk {
  path: Path,
  height: u32,
  hashes: Vec<Digest>,
  // the deepest relative rank, 1 to height, where any hash was written
  data_rank: u32,
}

impl HashChunk {
  pub fn new(path: Path, height: u32) -> Result<Self> {
    validate_height(height)?;
    if path::rank(path) % height != 0 {
      return Err(Error::InvalidData(format!("chunk path {path} is not at a multiple of height {height}")));
    }
    let hashes = vec![digest::zero_digest(); chunk_size(height)];
    Ok(HashChunk { path, height, hashes, data_rank: 1 })
  }

  pub fn into_handle(self) -> ChunkHandle {
    Arc::new(Mutex::new(self))
  }

  pub fn path(&self) -> Path {
    self.path
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn data_rank(&self) -> u32 {
    self.data_rank
  }

  pub fn size(&self) -> usize {
    self.hashes.len()
  }

  pub fn id(&self) -> u64 {
    chunk_path_to_chunk_id(self.path, self.height)
  }

  pub fn contains(&self, path: Path) -> bool {
    path_index(path, self.path, self.height).is_ok()
  }

  pub fn get_hash_at_path(&self, path: Path) -> Result<Digest> {
    let index = path_index(path, self.path, self.height)?;
    Ok(self.hashes[index])
  }

  pub fn get_hash_at_index(&self, index: usize) -> Option<Digest> {
    self.hashes.get(index).copied()
  }

  /// Stores a hash for the given path. Paths at internal ranks are stored at the slot of their
  /// left-most grand child.
  pub fn set_hash_at_path(&mut self, path: Path, hash: &Digest) -> Result<()> {
    let index = path_index(path, self.path, self.height)?;
    self.hashes[index] = *hash;
    let relative_rank = path::rank(path) - path::rank(self.path);
    self.data_rank = self.data_rank.max(relative_rank);
    Ok(())
  }

  /// Computes the hash of a path inside this chunk from the hashes stored below it. Paths at or
  /// beyond `first_leaf_path` are leaves and are read directly.
  pub fn calc_hash(&self, path: Path, first_leaf_path: Path, last_leaf_path: Path) -> Result<Digest> {
    let path_rank = path::rank(path);
    let chunk_rank = path::rank(self.path);
    debug_assert!(path_rank >= chunk_rank && path_rank <= chunk_rank + self.height);
    self
      .calc(chunk_rank + self.height - path_rank, path, first_leaf_path, last_leaf_path)?
      .ok_or_else(|| Error::InvalidData(format!("no hash for path {path} beyond the last leaf path {last_leaf_path}")))
  }

  /// Hash at the chunk path. It belongs to the parent chunk and is therefore never stored here.
  pub fn chunk_root_hash(&self, first_leaf_path: Path, last_leaf_path: Path) -> Result<Digest> {
    self
      .calc(self.height, self.path, first_leaf_path, last_leaf_path)?
      .ok_or_else(|| Error::InvalidData(format!("chunk {} has no hashes", self.path)))
  }

  fn calc(&self, h: Rank, path: Path, first_leaf_path: Path, last_leaf_path: Path) -> Result<Option<Digest>> {
    if path > last_leaf_path {
      // the missing second child of a single-leaf tree
      debug_assert_eq!(2, path);
      return Ok(None);
    }
    if h == 0 || path >= first_leaf_path {
      return self.get_hash_at_path(path).map(Some);
    }
    let left_path = path::left_child(path);
    let left = self
      .calc(h - 1, left_path, first_leaf_path, last_leaf_path)?
      .ok_or_else(|| Error::InvalidData(format!("missing left child {left_path}")))?;
    let right = self.calc(h - 1, path::right_child(path), first_leaf_path, last_leaf_path)?;
    Ok(Some(digest::hash_internal(&left, right.as_ref())))
  }

  /// Writes the chunk in packed form: only the `2^data_rank` hashes that can hold data are written.
  pub fn write_to<W: Write>(&self, w: &mut W) -> Result<usize> {
    // Path (8 bytes)
    w.write_u64::<LittleEndian>(self.path)?;

    // Hash count (4 bytes)
    let count = chunk_size(self.data_rank);
    w.write_u32::<LittleEndian>(count as u32)?;

    // Hashes
    let step = 1 << (self.height - self.data_rank);
    for i in (0..self.hashes.len()).step_by(step) {
      w.write_all(self.hashes[i].as_bytes())?;
    }
    Ok(8 + 4 + count * DIGEST_SIZE)
  }

  /// Reads a chunk written by [`HashChunk::write_to`]. The height is not part of the serialized form,
  /// the caller has to provide the same height the chunk was written with.
  pub fn read_from<R: Read>(r: &mut R, height: u32) -> Result<Self> {
    let path = r.read_u64::<LittleEndian>()?;
    let mut chunk = HashChunk::new(path, height)?;

    let count = r.read_u32::<LittleEndian>()? as usize;
    if count < 2 || !count.is_power_of_two() || count > chunk.size() {
      return Err(Error::InvalidData(format!("wrong hash count / height: {count} / {height}")));
    }
    let data_rank = count.trailing_zeros();
    let step = 1 << (height - data_rank);
    let mut bytes = [0u8; DIGEST_SIZE];
    for i in 0..count {
      r.read_exact(&mut bytes)?;
      chunk.hashes[i * step] = Digest::from_bytes(bytes);
    }
    chunk.data_rank = data_rank;
    Ok(chunk)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(8 + 4 + self.hashes.len() * DIGEST_SIZE);
    self.write_to(&mut buffer)?;
    Ok(buffer)
  }

  pub fn from_bytes(mut bytes: &[u8], height: u32) -> Result<Self> {
    Self::read_from(&mut bytes, height)
  }
}

pub fn validate_height(height: u32) -> Result<()> {
  if height == 0 || height > MAX_CHUNK_HEIGHT { Err(Error::InvalidChunkHeight(height)) } else { Ok(()) }
}

#[inline]
pub fn chunk_size(height: u32) -> usize {
  1 << height
}

/// Index of `path` among the slots of the chunk at `chunk_path`. Internal paths map to the slot of
/// their left-most grand child at the last chunk rank.
pub fn path_index(path: Path, chunk_path: Path, height: u32) -> Result<usize> {
  let outside = || Error::PathOutsideChunk { path, chunk_path, height };
  let chunk_rank = path::rank(chunk_path);
  let path_rank = path::rank(path);
  if path_rank <= chunk_rank || path_rank > chunk_rank + height {
    return Err(outside());
  }
  let rank_dif = path_rank % height;
  let mapped = if rank_dif != 0 { path::left_grand_child(path, height - rank_dif) } else { path };
  let first = path::left_grand_child(chunk_path, height);
  if mapped < first || mapped - first >= chunk_size(height) as u64 {
    return Err(outside());
  }
  Ok((mapped - first) as usize)
}

/// Path of the chunk that stores the hash of `path`.
pub fn path_to_chunk_path(path: Path, height: u32) -> Path {
  debug_assert!(path > path::ROOT_PATH);
  let rank_dif = path::rank(path) % height;
  path::grand_parent(path, if rank_dif == 0 { height } else { rank_dif })
}

/// Chunk ids number chunks breadth first: the root chunk is 0, its `2^height` children are 1 to
/// `2^height`, and so on. Unlike chunk paths, ids are dense, which keeps storage indices compact.
pub fn path_to_chunk_id(path: Path, height: u32) -> u64 {
  debug_assert!(path > path::ROOT_PATH);
  debug_assert!(height > 0);
  let pp = path + 1;
  let z = pp.leading_zeros();
  let r = (u64::BITS - z - 2) % height + 1;
  let m = (1u64 << 63) >> (z + r);
  ((pp >> r) ^ m) + (m - 1) / ((1u64 << height) - 1)
}

pub fn chunk_path_to_chunk_id(chunk_path: Path, height: u32) -> u64 {
  path_to_chunk_id(path::left_child(chunk_path), height)
}

pub fn chunk_id_to_chunk_path(chunk_id: u64, height: u32) -> Path {
  debug_assert!(height > 0);
  if chunk_id == 0 {
    return path::ROOT_PATH;
  }
  let child_count = 1u64 << height;
  let mut chunk_rank = 0;
  let mut chunks_at_rank = 1u64;
  let mut id = 0u64;
  while id < chunk_id {
    chunks_at_rank *= child_count;
    id += chunks_at_rank;
    chunk_rank += height;
  }
  path::first_path_at_rank(chunk_rank) + chunk_id - id + chunks_at_rank - 1
}

/// The minimal chunk id such that chunks `0..=id` hold every hash up to and including `max_path`.
pub fn last_chunk_id_for_paths(max_path: Path, height: u32) -> u64 {
  debug_assert!(max_path > path::ROOT_PATH);
  let max_path_chunk_id = path_to_chunk_id(max_path, height);
  // the last path at the previous rank may live in a chunk with a greater id
  let prev_rank = (path::rank(max_path) - 1).max(1);
  let max_path_in_prev_rank = path::right_grand_child(path::ROOT_PATH, prev_rank);
  path_to_chunk_id(max_path_in_prev_rank, height).max(max_path_chunk_id)
}

#[cfg(test)]
mod test;
