use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::digest::{self, Digest};
use crate::error::{Error, Result};
use crate::path::Path;

pub const MAX_DATA_SIZE: usize = 16 * 1024 * 1024;

/// Binary codec used for everything that is written to a [`crate::store::HashStore`].
pub trait Serializable: Sized {
  /// Writes this value and returns the number of bytes written.
  fn write<W: Write>(&self, w: &mut W) -> Result<usize>;

  fn read<R: Read>(r: &mut R) -> Result<Self>;

  fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    self.write(&mut buffer)?;
    Ok(buffer)
  }

  fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
    Self::read(&mut bytes)
  }
}

/// A leaf of the virtual tree: its current path and its key/value payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
  pub path: Path,
  pub key: Vec<u8>,
  pub value: Vec<u8>,
}

impl LeafRecord {
  pub fn new(path: Path, key: Vec<u8>, value: Vec<u8>) -> Self {
    LeafRecord { path, key, value }
  }

  /// Computes the leaf digest. The path is not part of the digest, so a leaf that moves to another
  /// path keeps its hash.
  pub fn hash(&self) -> Digest {
    digest::with_scratch(|hasher| {
      digest::begin_leaf(hasher);
      hasher.update(&(self.key.len() as u32).to_le_bytes());
      hasher.update(&self.key);
      hasher.update(&(self.value.len() as u32).to_le_bytes());
      hasher.update(&self.value);
    })
  }
}

impl Serializable for LeafRecord {
  fn write<W: Write>(&self, w: &mut W) -> Result<usize> {
    // Path (8 bytes)
    w.write_u64::<LittleEndian>(self.path)?;

    // Key and value, each prefixed by its length (4 bytes)
    w.write_u32::<LittleEndian>(self.key.len() as u32)?;
    w.write_all(&self.key)?;
    w.write_u32::<LittleEndian>(self.value.len() as u32)?;
    w.write_all(&self.value)?;
    Ok(8 + 4 + self.key.len() + 4 + self.value.len())
  }

  fn read<R: Read>(r: &mut R) -> Result<Self> {
    let path = r.read_u64::<LittleEndian>()?;
    let key = read_sized(r)?;
    let value = read_sized(r)?;
    Ok(LeafRecord { path, key, value })
  }
}

fn read_sized<R: Read>(r: &mut R) -> Result<Vec<u8>> {
  let len = r.read_u32::<LittleEndian>()? as usize;
  if len > MAX_DATA_SIZE {
    return Err(Error::InvalidData(format!("leaf data too large: {len} bytes")));
  }
  let mut data = vec![0u8; len];
  r.read_exact(&mut data)?;
  Ok(data)
}

/// The inclusive path interval `[first, last]` that holds all leaves of a non-empty tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRange {
  pub first: Path,
  pub last: Path,
}

impl LeafRange {
  pub fn new(first: Path, last: Path) -> Result<Self> {
    if first < 1 || last < first || first == crate::path::INVALID_PATH || last == crate::path::INVALID_PATH {
      return Err(Error::InvalidRange { first, last });
    }
    Ok(LeafRange { first, last })
  }

  /// Leaf range of a tree with `n` leaves, or `None` for an empty tree.
  pub fn for_size(n: u64) -> Option<Self> {
    match n {
      0 => None,
      1 => Some(LeafRange { first: 1, last: 1 }),
      n => Some(LeafRange { first: n - 1, last: 2 * n - 2 }),
    }
  }

  pub fn size(&self) -> u64 {
    if self.first == self.last { 1 } else { self.last - self.first + 1 }
  }

  pub fn contains(&self, path: Path) -> bool {
    self.first <= path && path <= self.last
  }

  /// Path of the `k`-th leaf, `0 ≦ k < size`.
  pub fn leaf_path(&self, k: u64) -> Path {
    debug_assert!(k < self.size());
    self.first + k
  }
}

impl Serializable for LeafRange {
  fn write<W: Write>(&self, w: &mut W) -> Result<usize> {
    w.write_u64::<LittleEndian>(self.first)?;
    w.write_u64::<LittleEndian>(self.last)?;
    Ok(8 + 8)
  }

  fn read<R: Read>(r: &mut R) -> Result<Self> {
    let first = r.read_u64::<LittleEndian>()?;
    let last = r.read_u64::<LittleEndian>()?;
    LeafRange::new(first, last)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn leaf_hash_ignores_path() {
    let a = LeafRecord::new(3, b"key".to_vec(), b"value".to_vec());
    let b = LeafRecord::new(9, b"key".to_vec(), b"value".to_vec());
    assert_eq!(a.hash(), b.hash());
    let c = LeafRecord::new(3, b"key".to_vec(), b"other".to_vec());
    assert_ne!(a.hash(), c.hash());
    // key/value boundary is part of the digest
    let d = LeafRecord::new(3, b"keyv".to_vec(), b"alue".to_vec());
    assert_ne!(a.hash(), d.hash());
  }

  #[test]
  fn leaf_record_codec() {
    let leaf = LeafRecord::new(42, b"apple".to_vec(), vec![0xAB; 300]);
    let bytes = leaf.to_bytes().unwrap();
    assert_eq!(8 + 4 + 5 + 4 + 300, bytes.len());
    assert_eq!(leaf, LeafRecord::from_bytes(&bytes).unwrap());
    assert!(LeafRecord::from_bytes(&bytes[..bytes.len() - 1]).is_err());
  }

  #[test]
  fn leaf_range_for_size() {
    assert_eq!(None, LeafRange::for_size(0));
    assert_eq!(Some(LeafRange { first: 1, last: 1 }), LeafRange::for_size(1));
    assert_eq!(Some(LeafRange { first: 1, last: 2 }), LeafRange::for_size(2));
    assert_eq!(Some(LeafRange { first: 2, last: 4 }), LeafRange::for_size(3));
    assert_eq!(Some(LeafRange { first: 52, last: 104 }), LeafRange::for_size(53));
    for n in 1..200 {
      assert_eq!(n, LeafRange::for_size(n).unwrap().size());
    }
  }

  #[test]
  fn leaf_range_rejects_invalid_bounds() {
    assert!(matches!(LeafRange::new(0, 2), Err(Error::InvalidRange { .. })));
    assert!(matches!(LeafRange::new(3, 2), Err(Error::InvalidRange { .. })));
    assert!(LeafRange::new(1, 1).is_ok());
  }
}
