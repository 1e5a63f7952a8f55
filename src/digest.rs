use std::cell::RefCell;

use blake3::{Hasher, OUT_LEN};

/// A fixed-size tree digest.
pub type Digest = blake3::Hash;

pub const DIGEST_SIZE: usize = OUT_LEN;

const LEAF_MARK: u8 = 0x00;
const SINGLE_CHILD_MARK: u8 = 0x01;
const TWO_CHILDREN_MARK: u8 = 0x02;

thread_local! {
  static SCRATCH: RefCell<Hasher> = RefCell::new(Hasher::new());
}

/// Runs `f` against this thread's scratch hasher and finalizes it. The hasher is reset afterwards so
/// that it can be reused by the next digest computed on the same thread.
pub fn with_scratch<F>(f: F) -> Digest
where
  F: FnOnce(&mut Hasher),
{
  SCRATCH.with(|cell| {
    let mut hasher = cell.borrow_mut();
    f(&mut hasher);
    let digest = hasher.finalize();
    hasher.reset();
    digest
  })
}

/// Combines two child digests into their parent digest. `right` is `None` only for the root of a
/// tree with exactly one leaf, whose second child does not exist.
pub fn hash_internal(left: &Digest, right: Option<&Digest>) -> Digest {
  with_scratch(|hasher| match right {
    Some(right) => {
      hasher.update(&[TWO_CHILDREN_MARK]);
      hasher.update(left.as_bytes());
      hasher.update(right.as_bytes());
    }
    None => {
      hasher.update(&[SINGLE_CHILD_MARK]);
      hasher.update(left.as_bytes());
    }
  })
}

/// Domain mark written before leaf content, so that leaf digests never collide with internal ones.
pub(crate) fn begin_leaf(hasher: &mut Hasher) {
  hasher.update(&[LEAF_MARK]);
}

/// Root digest of a tree without any leaves.
pub fn empty_root_hash() -> Digest {
  blake3::hash(&[LEAF_MARK])
}

pub fn zero_digest() -> Digest {
  Digest::from_bytes([0u8; DIGEST_SIZE])
}
