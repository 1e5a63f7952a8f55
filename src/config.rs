use std::fs::read_to_string;
use std::path::Path as FsPath;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::chunk;
use crate::error::{Error, Result};
use crate::flush::DEFAULT_FLUSH_THRESHOLD;

pub const DEFAULT_CHUNK_HEIGHT: u32 = 5;
pub const DEFAULT_FULL_REHASH_BUFFER: usize = 100_000;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "vtree-hasher";

/// Settings of the hasher and of the trees built on it, usually read from a TOML file. Every field
/// is optional there.
///
/// ```toml
/// chunk_height = 6
/// num_hash_threads = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
  /// Ranks per hash chunk, `1..=16`.
  pub chunk_height: u32,
  /// Worker threads of the hashing pool.
  pub num_hash_threads: usize,
  /// Chunks buffered by a full rehash before they are written to the store.
  pub flush_threshold: usize,
  /// Leaves queued between the store reader and the graph build during a full rehash.
  pub full_rehash_buffer: usize,
  pub thread_name_prefix: String,
}

impl Default for HasherConfig {
  fn default() -> Self {
    HasherConfig {
      chunk_height: DEFAULT_CHUNK_HEIGHT,
      num_hash_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      flush_threshold: DEFAULT_FLUSH_THRESHOLD,
      full_rehash_buffer: DEFAULT_FULL_REHASH_BUFFER,
      thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
    }
  }
}

impl HasherConfig {
  pub fn from_toml_str(s: &str) -> Result<Self> {
    let config: HasherConfig = toml::from_str(s)?;
    config.validate()?;
    Ok(config)
  }

  pub fn load<P: AsRef<FsPath>>(path: P) -> Result<Self> {
    Self::from_toml_str(&read_to_string(path)?)
  }

  pub fn to_toml_string(&self) -> Result<String> {
    toml::to_string(self).map_err(|e| Error::InvalidData(format!("cannot serialize config: {e}")))
  }

  pub fn validate(&self) -> Result<()> {
    chunk::validate_height(self.chunk_height)?;
    let positive = [
      ("num_hash_threads", self.num_hash_threads),
      ("flush_threshold", self.flush_threshold),
      ("full_rehash_buffer", self.full_rehash_buffer),
    ];
    match positive.iter().find(|(_, value)| *value == 0) {
      Some((name, _)) => Err(Error::InvalidData(format!("{name} must be positive"))),
      None => Ok(()),
    }
  }

  /// Builds the worker pool of a [`crate::VirtualHasher`].
  pub fn build_pool(&self) -> Result<ThreadPool> {
    self.validate()?;
    let prefix = self.thread_name_prefix.clone();
    let pool = ThreadPoolBuilder::new()
      .num_threads(self.num_hash_threads)
      .thread_name(move |i| format!("{prefix}-{i}"))
      .build()?;
    Ok(pool)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_fill_missing_fields() {
    let config = HasherConfig::from_toml_str("chunk_height = 7").unwrap();
    assert_eq!(7, config.chunk_height);
    assert_eq!(DEFAULT_FLUSH_THRESHOLD, config.flush_threshold);
    assert_eq!(DEFAULT_FULL_REHASH_BUFFER, config.full_rehash_buffer);
    assert!(config.num_hash_threads >= 1);
    assert_eq!(HasherConfig::default(), HasherConfig::from_toml_str("").unwrap());
  }

  #[test]
  fn invalid_values_are_rejected() {
    assert!(matches!(HasherConfig::from_toml_str("chunk_height = 0"), Err(Error::InvalidChunkHeight(0))));
    assert!(matches!(HasherConfig::from_toml_str("chunk_height = 17"), Err(Error::InvalidChunkHeight(17))));
    assert!(matches!(HasherConfig::from_toml_str("num_hash_threads = 0"), Err(Error::InvalidData(_))));
    assert!(matches!(HasherConfig::from_toml_str("chunk_height = \"five\""), Err(Error::Config(_))));
  }

  #[test]
  fn round_trips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hasher.toml");
    let config = HasherConfig { chunk_height: 3, num_hash_threads: 2, ..HasherConfig::default() };
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
    assert_eq!(config, HasherConfig::load(&path).unwrap());
    assert!(matches!(HasherConfig::load(dir.path().join("missing.toml")), Err(Error::Io(_))));
  }

  #[test]
  fn pool_threads_are_named() {
    let config =
      HasherConfig { num_hash_threads: 2, thread_name_prefix: "test-hasher".to_string(), ..Default::default() };
    let pool = config.build_pool().unwrap();
    assert_eq!(2, pool.current_num_threads());
    let name = pool.install(|| std::thread::current().name().map(str::to_string));
    assert!(name.unwrap().starts_with("test-hasher-"));
  }
}
