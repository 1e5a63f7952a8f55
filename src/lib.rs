use std::fs::{metadata, read_dir};
use std::path::Path as FsPath;

pub mod chunk;
pub mod config;
pub mod digest;
pub mod error;
pub mod flush;
pub mod hasher;
pub mod leaf;
pub mod listener;
pub mod path;
pub mod stat;
pub mod store;
pub mod tree;

pub use chunk::{ChunkHandle, HashChunk};
pub use config::HasherConfig;
pub use digest::Digest;
pub use error::{Error, Result};
pub use flush::{FlushStatistics, FullRehashFlushListener};
pub use hasher::VirtualHasher;
pub use leaf::{LeafRange, LeafRecord};
pub use listener::{HashListener, NoopListener};
pub use path::Path;
pub use store::{ChunkLoader, ChunkPreloader, HashStore, MemoryStore, RocksDbStore};
pub use tree::VirtualTree;

/// Deterministic pseudo-random bytes for `value`, used to fill test and benchmark leaves.
#[inline]
pub fn u64_to_rand_bytes(value: u64, buffer: &mut [u8; 8]) {
  // SplitMix64
  let mut z = value.wrapping_add(0x9e3779b97f4a7c15);
  z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
  let z = z ^ (z >> 31);

  buffer.copy_from_slice(&z.to_le_bytes());
}

/// Leaf `k` of a synthetic tree of `range`, with a key derived from `k` and a value from `version`.
pub fn synthetic_leaf(range: LeafRange, k: u64, version: u64) -> LeafRecord {
  let mut key = [0u8; 8];
  let mut value = [0u8; 8];
  u64_to_rand_bytes(k, &mut key);
  u64_to_rand_bytes(k ^ version.rotate_left(32), &mut value);
  LeafRecord::new(range.leaf_path(k), key.to_vec(), value.to_vec())
}

/// Total size of a file, or of all files below a directory. Unreadable entries count as empty.
pub fn file_size<P: AsRef<FsPath>>(path: P) -> u64 {
  let path = path.as_ref();
  if path.is_file() {
    metadata(path).map(|m| m.len()).unwrap_or(0)
  } else if path.is_dir() {
    read_dir(path)
      .map(|entries| entries.flat_map(std::result::Result::ok).map(|e| file_size(e.path())).sum())
      .unwrap_or(0)
  } else {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rand_bytes_are_deterministic() {
    let (mut a, mut b) = ([0u8; 8], [0u8; 8]);
    u64_to_rand_bytes(7, &mut a);
    u64_to_rand_bytes(7, &mut b);
    assert_eq!(a, b);
    u64_to_rand_bytes(8, &mut b);
    assert_ne!(a, b);
    u64_to_rand_bytes(u64::MAX, &mut b);
  }

  #[test]
  fn synthetic_leaves_change_with_version() {
    let range = LeafRange::for_size(10).unwrap();
    let a = synthetic_leaf(range, 3, 0);
    assert_eq!(range.first + 3, a.path);
    assert_eq!(a, synthetic_leaf(range, 3, 0));
    let b = synthetic_leaf(range, 3, 1);
    assert_eq!(a.key, b.key);
    assert_ne!(a.value, b.value);
  }

  #[test]
  fn file_size_sums_directories() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), [0u8; 10]).unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub").join("b"), [0u8; 5]).unwrap();
    assert_eq!(15, file_size(dir.path()));
    assert_eq!(10, file_size(dir.path().join("a")));
    assert_eq!(0, file_size(dir.path().join("missing")));
  }
}
