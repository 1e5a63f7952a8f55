use std::fs::{self, create_dir_all};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use clap::Parser;
use rand::seq::index::sample;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtree_hasher::stat::{Report, Unit};
use vtree_hasher::{
  HashStore, HasherConfig, LeafRange, MemoryStore, Result, RocksDbStore, VirtualHasher, VirtualTree, file_size,
  synthetic_leaf,
};

const WORK_DIR_PREFIX: &str = "vtree_bench-";

#[derive(Parser)]
#[command(name = "vtree-bench")]
#[command(author, version, about = "Benchmark full and incremental hashing of virtual trees")]
struct Args {
  /// Number of leaves of the largest tree
  #[arg(default_value_t = 1024 * 1024u64)]
  data_size: u64,

  /// Directory for working files
  #[arg(short, long, default_value_t = std::env::temp_dir().to_string_lossy().into_owned())]
  dir: String,

  /// Directory the CSV reports are written to
  #[arg(short, long, default_value = ".")]
  output: String,

  #[arg(short, long, default_value_t = Local::now().format("%Y%m%d%H%M%S").to_string())]
  session: String,

  /// Hasher settings in TOML; command line options override them
  #[arg(long)]
  config: Option<PathBuf>,

  #[arg(long)]
  chunk_height: Option<u32>,

  #[arg(long)]
  threads: Option<usize>,

  /// Share of leaves changed by each incremental update
  #[arg(long, default_value_t = 0.01)]
  dirty_ratio: f64,

  /// Measurements per data point
  #[arg(short, long, default_value_t = 5)]
  trials: usize,

  /// Number of data points
  #[arg(long, default_value_t = 8)]
  division: usize,

  /// Remove the working files of earlier sessions and exit
  #[arg(short, long, default_value_t = false)]
  clean: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();
  let args = Args::parse();

  let experiment = Experiment::new(&args)?;
  if args.clean {
    return experiment.clean();
  }
  println!("Working directory: {:?}", &experiment.dir);
  info!(config = ?experiment.config, "hasher configured");

  let max_n = args.data_size.max(2);
  experiment.case("full-memory")?.measure_full_build(max_n, |_case| MemoryStore::new(experiment.chunk_height()))?;
  experiment.case("full-rocksdb")?.measure_full_build(max_n, |case| {
    RocksDbStore::open(case.dir_work.join("tree.db"), experiment.chunk_height())
  })?;
  experiment
    .case("incremental-memory")?
    .measure_incremental(max_n, args.dirty_ratio, |_case| MemoryStore::new(experiment.chunk_height()))?;
  experiment.case("incremental-rocksdb")?.measure_incremental(max_n, args.dirty_ratio, |case| {
    RocksDbStore::open(case.dir_work.join("tree.db"), experiment.chunk_height())
  })?;
  experiment.case("rehash-rocksdb")?.measure_full_rehash(max_n)?;
  Ok(())
}

struct Experiment {
  session: String,
  dir: PathBuf,
  dir_report: PathBuf,
  config: HasherConfig,
  hasher: Arc<VirtualHasher>,
  trials: usize,
  division: usize,
}

struct Case<'a> {
  experiment: &'a Experiment,
  id: String,
  name: String,
  dir_work: PathBuf,
}

impl Experiment {
  fn new(args: &Args) -> Result<Self> {
    let dir = PathBuf::from(&args.dir);
    let dir_report = PathBuf::from(&args.output);
    create_dir_all(&dir)?;
    create_dir_all(&dir_report)?;

    let mut config = match &args.config {
      Some(path) => HasherConfig::load(path)?,
      None => HasherConfig::default(),
    };
    if let Some(chunk_height) = args.chunk_height {
      config.chunk_height = chunk_height;
    }
    if let Some(threads) = args.threads {
      config.num_hash_threads = threads;
    }
    config.validate()?;
    let hasher = Arc::new(VirtualHasher::from_config(&config)?);

    Ok(Experiment {
      session: args.session.clone(),
      dir,
      dir_report,
      config,
      hasher,
      trials: args.trials.max(1),
      division: args.division.max(2),
    })
  }

  fn chunk_height(&self) -> u32 {
    self.config.chunk_height
  }

  fn case(&self, id: &str) -> Result<Case<'_>> {
    let name = format!("{}-{id}", self.session);
    let dir_work = self.dir.join(format!("{WORK_DIR_PREFIX}{name}"));
    create_dir_all(&dir_work)?;
    Ok(Case { experiment: self, id: id.to_string(), name, dir_work })
  }

  fn tree<S: HashStore>(&self, store: S) -> Result<VirtualTree<S>> {
    VirtualTree::new(store, self.hasher.clone(), &self.config)
  }

  fn clean(&self) -> Result<()> {
    let mut total = 0u64;
    let mut count = 0;
    for entry in fs::read_dir(&self.dir)? {
      let e = entry?;
      if e.file_name().to_string_lossy().starts_with(WORK_DIR_PREFIX) {
        let path = e.path();
        let size = file_size(&path);
        println!("Removing: {} ({} bytes)", path.display(), size);
        if path.is_dir() { fs::remove_dir_all(&path)? } else { fs::remove_file(&path)? }
        total += size;
        count += 1;
      }
    }
    eprintln!("{count} files are removed, total {total} bytes");
    Ok(())
  }
}

impl Case<'_> {
  fn reset(&self) -> Result<()> {
    if self.dir_work.exists() {
      fs::remove_dir_all(&self.dir_work)?;
    }
    create_dir_all(&self.dir_work)?;
    Ok(())
  }

  fn save(&self, report: &Report<u64, f64>, x_label: &str) -> Result<()> {
    let path = self.experiment.dir_report.join(format!("{}.csv", self.name));
    report.save_xy_to_csv(&path, x_label, "TIME")?;
    println!("==> The results have been saved in: {}", path.to_string_lossy());
    Ok(())
  }

  /// Hashing time of a tree built from all of its leaves, relative to the number of leaves.
  fn measure_full_build<S, F>(&self, max_n: u64, open: F) -> Result<()>
  where
    S: HashStore,
    F: Fn(&Case) -> Result<S>,
  {
    println!("[{}]", self.id);
    let mut report = Report::new(Unit::Milliseconds);
    let gauge = linspace(max_n / self.experiment.division as u64, max_n, self.experiment.division);
    for (i, n) in gauge.into_iter().enumerate() {
      let range = leaf_range(n)?;
      let mut size = 0;
      eprint!("  [{}/{}] n={n}: ", i + 1, self.experiment.division);
      for _ in 0..self.experiment.trials {
        self.reset()?;
        let tree = self.experiment.tree(open(self)?)?;
        let leaves = (0..n).map(|k| synthetic_leaf(range, k, 0)).collect();
        let elapsed = timed(|| tree.update(Some(range), leaves, Vec::new()))?;
        report.add(n, millis(elapsed));
        drop(tree);
        size = size.max(file_size(&self.dir_work));
      }
      if let Some(stat) = report.calculate(n) {
        eprintln!("{stat}; {size} bytes");
      }
    }
    self.reset()?;
    self.save(&report, "N")
  }

  /// Hashing time of updates to a tree of `max_n` leaves, relative to the number of dirty leaves.
  fn measure_incremental<S, F>(&self, max_n: u64, dirty_ratio: f64, open: F) -> Result<()>
  where
    S: HashStore,
    F: Fn(&Case) -> Result<S>,
  {
    println!("[{}]", self.id);
    self.reset()?;
    let range = leaf_range(max_n)?;
    let tree = self.experiment.tree(open(self)?)?;
    let leaves = (0..max_n).map(|k| synthetic_leaf(range, k, 0)).collect();
    let elapsed = timed(|| tree.update(Some(range), leaves, Vec::new()))?;
    eprintln!("  initial build of {max_n} leaves: {:.3}ms", millis(elapsed));

    let max_dirty = ((max_n as f64 * dirty_ratio.clamp(0.0, 1.0)) as u64).max(1);
    let gauge = linspace(max_dirty / self.experiment.division as u64, max_dirty, self.experiment.division);
    let mut rng = rand::rng();
    let mut report = Report::new(Unit::Milliseconds);
    let mut version = 0;
    for (i, dirty) in gauge.into_iter().enumerate() {
      let dirty = dirty.max(1);
      eprint!("  [{}/{}] dirty={dirty}: ", i + 1, self.experiment.division);
      for _ in 0..self.experiment.trials {
        version += 1;
        let leaves = sample(&mut rng, max_n as usize, dirty as usize)
          .into_iter()
          .map(|k| synthetic_leaf(range, k as u64, version))
          .collect();
        let elapsed = timed(|| tree.update(Some(range), leaves, Vec::new()))?;
        report.add(dirty, millis(elapsed));
      }
      if let Some(stat) = report.calculate(dirty) {
        eprintln!("{stat}");
      }
    }
    drop(tree);
    self.reset()?;
    self.save(&report, "DIRTY")
  }

  /// Time of a full rehash of a stored tree, relative to the number of leaves.
  fn measure_full_rehash(&self, max_n: u64) -> Result<()> {
    println!("[{}]", self.id);
    let mut report = Report::new(Unit::Milliseconds);
    let gauge = linspace(max_n / self.experiment.division as u64, max_n, self.experiment.division);
    for (i, n) in gauge.into_iter().enumerate() {
      self.reset()?;
      let range = leaf_range(n)?;
      let store = RocksDbStore::open(self.dir_work.join("tree.db"), self.experiment.chunk_height())?;
      let tree = self.experiment.tree(store)?;
      let leaves = (0..n).map(|k| synthetic_leaf(range, k, 0)).collect();
      tree.update(Some(range), leaves, Vec::new())?;
      eprint!("  [{}/{}] n={n}: ", i + 1, self.experiment.division);
      for _ in 0..self.experiment.trials {
        let elapsed = timed(|| tree.full_rehash())?;
        report.add(n, millis(elapsed));
      }
      if let Some(stat) = report.calculate(n) {
        eprintln!("{stat}; flushes {}", tree.statistics().flush_stat());
      }
    }
    self.reset()?;
    self.save(&report, "N")
  }
}

fn leaf_range(n: u64) -> Result<LeafRange> {
  LeafRange::for_size(n).ok_or(vtree_hasher::Error::InvalidRange { first: 0, last: 0 })
}

fn timed<T, F: FnOnce() -> Result<T>>(f: F) -> Result<Duration> {
  let t0 = Instant::now();
  f()?;
  Ok(t0.elapsed())
}

fn millis(elapsed: Duration) -> f64 {
  elapsed.as_nanos() as f64 / 1000.0 / 1000.0
}

fn linspace(min: u64, max: u64, n: usize) -> Vec<u64> {
  let min = min.max(1);
  let step = (max - min.min(max)) as f64 / (n - 1) as f64;
  let mut gauge = (0..n).map(|i| (min as f64 + step * i as f64).round() as u64).collect::<Vec<_>>();
  gauge.dedup();
  gauge
}
