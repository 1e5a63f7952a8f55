use crate::chunk::HashChunk;
use crate::error::Result;
use crate::leaf::LeafRecord;
use crate::path::Path;

/// Observer of a hashing pass. Apart from [`HashListener::on_hashing_started`], every callback is
/// invoked from the hasher's worker threads, possibly concurrently, so implementations synchronize
/// their own state.
///
/// A callback that returns an error fails the task that invoked it, and with it the whole pass.
pub trait HashListener: Sync {
  fn on_hashing_started(&self, _first_leaf_path: Path, _last_leaf_path: Path) {}

  fn on_leaf_hashed(&self, _leaf: &LeafRecord) -> Result<()> {
    Ok(())
  }

  /// Called exactly once for every chunk touched by the pass, after all of its hashes are final.
  fn on_chunk_hashed(&self, _chunk: &HashChunk) -> Result<()> {
    Ok(())
  }

  /// Called on the calling thread once the root hash has been computed. Not called if hashing failed.
  fn on_hashing_completed(&self) -> Result<()> {
    Ok(())
  }
}

pub struct NoopListener;

impl HashListener for NoopListener {}
