use super::*;
use crate::digest::hash_internal;

fn h(n: u64) -> Digest {
  blake3::hash(&n.to_le_bytes())
}

#[test]
fn verify_new_chunk() {
  let chunk = HashChunk::new(0, 3).unwrap();
  assert_eq!(8, chunk.size());
  assert_eq!(1, chunk.data_rank());
  assert_eq!(0, chunk.id());

  assert!(matches!(HashChunk::new(0, 0), Err(Error::InvalidChunkHeight(0))));
  assert!(matches!(HashChunk::new(0, MAX_CHUNK_HEIGHT + 1), Err(Error::InvalidChunkHeight(_))));
  assert!(HashChunk::new(0, MAX_CHUNK_HEIGHT).is_ok());
  // chunk paths must sit at a rank that is a multiple of the height
  assert!(HashChunk::new(1, 2).is_err());
  assert!(HashChunk::new(3, 2).is_ok());
  assert!(HashChunk::new(7, 3).is_ok());
}

#[test]
fn verify_path_index() {
  // root chunk of height 2 holds paths 1 to 6
  for (path, index) in [(3, 0), (4, 1), (5, 2), (6, 3), (1, 0), (2, 2)] {
    assert_eq!(index, path_index(path, 0, 2).unwrap(), "path_index({path}, 0, 2)");
  }
  for path in [0, 7, 14] {
    assert!(matches!(path_index(path, 0, 2), Err(Error::PathOutsideChunk { .. })), "{path}");
  }

  // chunk 4 of height 2 at rank 2 holds paths 9, 10 and 19 to 22
  for (path, index) in [(19, 0), (22, 3), (9, 0), (10, 2)] {
    assert_eq!(index, path_index(path, 4, 2).unwrap(), "path_index({path}, 4, 2)");
  }
  for path in [4, 7, 8, 11, 18, 23, 39] {
    assert!(path_index(path, 4, 2).is_err(), "{path}");
  }
}

#[test]
fn set_hash_tracks_data_rank() {
  let mut chunk = HashChunk::new(0, 4).unwrap();
  chunk.set_hash_at_path(1, &h(1)).unwrap();
  assert_eq!(1, chunk.data_rank());
  chunk.set_hash_at_path(9, &h(9)).unwrap();
  assert_eq!(3, chunk.data_rank());
  chunk.set_hash_at_path(5, &h(5)).unwrap();
  assert_eq!(3, chunk.data_rank());
  assert_eq!(h(9), chunk.get_hash_at_path(9).unwrap());
  assert_eq!(h(5), chunk.get_hash_at_path(5).unwrap());
  assert_eq!(h(1), chunk.get_hash_at_path(1).unwrap());
  assert!(chunk.set_hash_at_path(31, &h(31)).is_err());
}

#[test]
fn calc_hash_over_full_rank() {
  // eight leaves at paths 7 to 14
  let mut chunk = HashChunk::new(0, 3).unwrap();
  for path in 7..=14 {
    chunk.set_hash_at_path(path, &h(path)).unwrap();
  }
  let n3 = hash_internal(&h(7), Some(&h(8)));
  let n4 = hash_internal(&h(9), Some(&h(10)));
  let n5 = hash_internal(&h(11), Some(&h(12)));
  let n6 = hash_internal(&h(13), Some(&h(14)));
  let n1 = hash_internal(&n3, Some(&n4));
  let n2 = hash_internal(&n5, Some(&n6));
  assert_eq!(n3, chunk.calc_hash(3, 7, 14).unwrap());
  assert_eq!(n1, chunk.calc_hash(1, 7, 14).unwrap());
  assert_eq!(n2, chunk.calc_hash(2, 7, 14).unwrap());
  assert_eq!(h(12), chunk.calc_hash(12, 7, 14).unwrap());
  assert_eq!(hash_internal(&n1, Some(&n2)), chunk.chunk_root_hash(7, 14).unwrap());
}

#[test]
fn calc_hash_over_mixed_leaf_ranks() {
  // five leaves: paths 4, 5, 6 at rank 2 and 7, 8 at rank 3
  let mut chunk = HashChunk::new(0, 3).unwrap();
  for path in 4..=8 {
    chunk.set_hash_at_path(path, &h(path)).unwrap();
  }
  let n3 = hash_internal(&h(7), Some(&h(8)));
  let n1 = hash_internal(&n3, Some(&h(4)));
  let n2 = hash_internal(&h(5), Some(&h(6)));
  assert_eq!(n1, chunk.calc_hash(1, 4, 8).unwrap());
  assert_eq!(hash_internal(&n1, Some(&n2)), chunk.chunk_root_hash(4, 8).unwrap());
}

#[test]
fn single_leaf_chunk_root_uses_missing_sibling() {
  let mut chunk = HashChunk::new(0, 1).unwrap();
  chunk.set_hash_at_path(1, &h(1)).unwrap();
  assert_eq!(hash_internal(&h(1), None), chunk.chunk_root_hash(1, 1).unwrap());
}

#[test]
fn packed_serialization() {
  let mut chunk = HashChunk::new(15, 4).unwrap();
  // only rank 1 relative to the chunk is written: two hashes
  chunk.set_hash_at_path(31, &h(31)).unwrap();
  chunk.set_hash_at_path(32, &h(32)).unwrap();
  let bytes = chunk.to_bytes().unwrap();
  assert_eq!(8 + 4 + 2 * DIGEST_SIZE, bytes.len());
  let restored = HashChunk::from_bytes(&bytes, 4).unwrap();
  assert_eq!(chunk, restored);
  assert_eq!(h(32), restored.get_hash_at_path(32).unwrap());

  // a write at the last rank expands the packed form to all slots
  chunk.set_hash_at_path(path::left_grand_child(15, 4), &h(255)).unwrap();
  let bytes = chunk.to_bytes().unwrap();
  assert_eq!(8 + 4 + 16 * DIGEST_SIZE, bytes.len());
  assert_eq!(chunk, HashChunk::from_bytes(&bytes, 4).unwrap());

  // the height is not part of the serialized form
  assert!(HashChunk::from_bytes(&bytes, 3).is_err());
  assert!(HashChunk::from_bytes(&bytes[..bytes.len() - 1], 4).is_err());
}

#[test]
fn packed_serialization_rejects_wrong_counts() {
  for count in [0u32, 1, 3, 12, 32] {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&count.to_le_bytes());
    bytes.extend(std::iter::repeat_n(0u8, count as usize * DIGEST_SIZE));
    assert!(matches!(HashChunk::from_bytes(&bytes, 4), Err(Error::InvalidData(_))), "count={count}");
  }
}

#[test]
fn verify_chunk_ids() {
  // height 2: root chunk 0, chunks 1 to 4 at rank 2, chunks 5 to 20 at rank 4
  for (chunk_path, id) in [(0, 0), (3, 1), (6, 4), (15, 5), (30, 20), (63, 21)] {
    assert_eq!(id, chunk_path_to_chunk_id(chunk_path, 2), "chunk_path_to_chunk_id({chunk_path}, 2)");
    assert_eq!(chunk_path, chunk_id_to_chunk_path(id, 2), "chunk_id_to_chunk_path({id}, 2)");
  }
  for (path, id) in [(1, 0), (6, 0), (7, 1), (9, 2), (14, 4), (15, 1), (29, 4), (31, 5)] {
    assert_eq!(id, path_to_chunk_id(path, 2), "path_to_chunk_id({path}, 2)");
  }

  for height in 1..=6 {
    for id in 0..1000 {
      let chunk_path = chunk_id_to_chunk_path(id, height);
      assert_eq!(0, path::rank(chunk_path) % height);
      assert_eq!(id, chunk_path_to_chunk_id(chunk_path, height));
    }
    let mut max_id = 0;
    for path in 1..5000 {
      let chunk_path = path_to_chunk_path(path, height);
      assert!(path_index(path, chunk_path, height).is_ok(), "{path} in {chunk_path}/{height}");
      let id = path_to_chunk_id(path, height);
      assert_eq!(chunk_path_to_chunk_id(chunk_path, height), id);
      max_id = max_id.max(id);
      assert_eq!(max_id, last_chunk_id_for_paths(path, height), "last_chunk_id_for_paths({path}, {height})");
    }
  }
}
