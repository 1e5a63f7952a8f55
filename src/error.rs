use crate::path::Path;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("dirty leaves supplied with an invalid leaf path range [{first}, {last}]")]
  InvalidRange { first: Path, last: Path },

  #[error("dirty leaf at path {path} is unsorted, duplicated, or outside the leaf range [{first}, {last}]")]
  InvalidLeafPath { path: Path, first: Path, last: Path },

  #[error("chunk height {0} is out of range")]
  InvalidChunkHeight(u32),

  #[error("path {path} is not in chunk {chunk_path}/{height}")]
  PathOutsideChunk { path: Path, chunk_path: Path, height: u32 },

  #[error("failed to load hash chunk for path {0}")]
  ChunkLoad(Path),

  #[error("hashing task at path {path} failed")]
  TaskExecution {
    path: Path,
    #[source]
    source: Box<Error>,
  },

  #[error("hashing task panicked: {0}")]
  Panicked(String),

  #[error("failed to flush hashing results")]
  IoFlush(#[source] Box<Error>),

  #[error("invalid data: {0}")]
  InvalidData(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  RocksDb(#[from] rocksdb::Error),

  #[error(transparent)]
  Config(#[from] toml::de::Error),

  #[error(transparent)]
  ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
  /// Unwraps task and flush wrappers down to the error that actually occurred.
  pub fn root_cause(&self) -> &Error {
    match self {
      Error::TaskExecution { source, .. } | Error::IoFlush(source) => source.root_cause(),
      other => other,
    }
  }
}
