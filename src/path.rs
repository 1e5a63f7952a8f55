//! Path arithmetic for the virtual binary tree.
//!
//! Nodes are addressed by a dense integer path: the root is 0, and the children of `p` are
//! `2p + 1` and `2p + 2`. The rank of a path is its depth, so all paths of rank `r` lie in
//! `[2^r - 1, 2^(r+1) - 2]`.

pub type Path = u64;
pub type Rank = u32;

pub const ROOT_PATH: Path = 0;
pub const INVALID_PATH: Path = u64::MAX;

#[inline]
pub fn rank(path: Path) -> Rank {
  debug_assert!(path != INVALID_PATH);
  u64::BITS - 1 - (path + 1).leading_zeros()
}

#[inline]
pub fn parent(path: Path) -> Path {
  debug_assert!(path > ROOT_PATH);
  (path - 1) >> 1
}

#[inline]
pub fn left_child(path: Path) -> Path {
  (path << 1) + 1
}

#[inline]
pub fn right_child(path: Path) -> Path {
  (path << 1) + 2
}

#[inline]
pub fn is_left(path: Path) -> bool {
  path & 1 == 1
}

#[inline]
pub fn sibling(path: Path) -> Path {
  debug_assert!(path > ROOT_PATH);
  if is_left(path) { path + 1 } else { path - 1 }
}

/// The ancestor `n` ranks above `path`.
#[inline]
pub fn grand_parent(path: Path, n: Rank) -> Path {
  debug_assert!(rank(path) >= n);
  ((path + 1) >> n) - 1
}

/// The left-most descendant `n` ranks below `path`.
#[inline]
pub fn left_grand_child(path: Path, n: Rank) -> Path {
  ((path + 1) << n) - 1
}

/// The right-most descendant `n` ranks below `path`.
#[inline]
pub fn right_grand_child(path: Path, n: Rank) -> Path {
  ((path + 2) << n) - 2
}

/// First path at the given rank.
#[inline]
pub fn first_path_at_rank(rank: Rank) -> Path {
  left_grand_child(ROOT_PATH, rank)
}
