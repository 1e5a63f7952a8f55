use std::collections::HashMap;
use std::fmt::Display;
use std::fs::File;
use std::hash::Hash;
use std::io::{BufWriter, Write};
use std::path::Path as FsPath;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::flush::FlushStatistics;

pub trait IntoFloat: Copy {
  fn into_f64(self) -> f64;
}

impl IntoFloat for u64 {
  fn into_f64(self) -> f64 {
    self as f64
  }
}

impl IntoFloat for f64 {
  fn into_f64(self) -> f64 {
    self
  }
}

#[derive(Debug, Clone)]
pub struct Stat {
  unit: Unit,
  pub count: usize,
  pub mean: f64,
  pub median: f64,
  pub std_dev: f64,
  pub min: f64,
  pub max: f64,
}

impl Stat {
  /// calculate StdDev / Mean
  pub fn cv(&self) -> f64 {
    self.std_dev / self.mean
  }

  pub fn from_vec<T: IntoFloat>(unit: Unit, data: &[T]) -> Stat {
    if data.is_empty() {
      return Stat {
        unit,
        count: 0,
        mean: f64::NAN,
        median: f64::NAN,
        std_dev: f64::NAN,
        min: f64::NAN,
        max: f64::NAN,
      };
    }
    let mut data = data.iter().map(|y| y.into_f64()).collect::<Vec<_>>();
    data.sort_by(f64::total_cmp);
    let count = data.len();
    let (min, max) = (data[0], data[count - 1]);
    let mean = data.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
      let mid = count / 2;
      (data[mid - 1] + data[mid]) / 2.0
    } else {
      data[count / 2]
    };
    let variance = data
      .iter()
      .map(|&x| {
        let diff = x - mean;
        diff * diff
      })
      .sum::<f64>()
      / count as f64;
    let std_dev = variance.sqrt();
    Stat { unit, count, mean, median, std_dev, min, max }
  }
}

impl Display for Stat {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // 2σ (equivalent to 95.4% confidence interval) calculated as a percentage
    let two_sigma_percent = if self.mean > 0.0 { (2.0 * self.std_dev / self.mean) * 100.0 } else { 0.0 };
    f.write_fmt(format_args!(
      "{}: {} ±{:.1}% [{}|{}|{}]",
      self.count,
      self.unit.format(self.mean),
      two_sigma_percent,
      self.unit.short(self.min),
      self.unit.short(self.median),
      self.unit.short(self.max)
    ))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
  Bytes,
  Milliseconds,
  Count,
}

impl Unit {
  fn scaled_format(mut value: f64, scale: usize, unit: &str, auxs: &[&str], precision: usize) -> String {
    let mut unit_index = 0;
    while value >= scale as f64 && unit_index + 1 < auxs.len() {
      value /= scale as f64;
      unit_index += 1;
    }
    format!("{:.precision$}{}{}", value, auxs[unit_index], unit, precision = precision)
  }

  fn format(&self, value: f64) -> String {
    match self {
      Self::Bytes => Self::scaled_format(value, 1024, "B", &["", "k", "M", "G", "T", "P"], 2),
      Self::Milliseconds => Self::scaled_format(value * 1000.0 * 1000.0, 1000, "s", &["n", "μ", "m", ""], 2),
      Self::Count => Self::scaled_format(value, 1000, "", &["", "k", "M", "G"], 2),
    }
  }

  fn short(&self, value: f64) -> String {
    match self {
      Self::Bytes => Self::scaled_format(value, 1024, "", &["", "k", "M", "G", "T", "P"], 0),
      Self::Milliseconds => Self::scaled_format(value * 1000.0 * 1000.0, 1000, "", &["n", "μ", "m", ""], 0),
      Self::Count => Self::scaled_format(value, 1000, "", &["", "k", "M", "G"], 0),
    }
  }
}

/// Samples grouped by an x value, written out as one CSV row per x.
pub struct Report<X: Display + Copy + Hash + Eq + Ord, Y: IntoFloat + Display> {
  unit: Unit,
  data_set: HashMap<X, Vec<Y>>,
}

impl<X: Display + Copy + Hash + Eq + Ord, Y: IntoFloat + Display> Report<X, Y> {
  pub fn new(unit: Unit) -> Self {
    Report { unit, data_set: HashMap::new() }
  }

  pub fn add(&mut self, x: X, y: Y) -> Stat {
    self.append(x, vec![y])
  }

  pub fn append(&mut self, x: X, mut ys: Vec<Y>) -> Stat {
    let data = self.data_set.entry(x).or_default();
    data.append(&mut ys);
    Stat::from_vec(self.unit, data)
  }

  pub fn calculate(&self, x: X) -> Option<Stat> {
    self.data_set.get(&x).map(|ys| Stat::from_vec(self.unit, ys))
  }

  pub fn save_xy_to_csv<P: AsRef<FsPath>>(&self, path: P, x_label: &str, y_labels: &str) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{x_label},{y_labels}")?;

    let mut xs = self.data_set.iter().collect::<Vec<_>>();
    xs.sort_unstable_by_key(|(x, _)| **x);
    for (x, ys) in xs {
      let ys = ys.iter().map(|y| format!("{y}")).collect::<Vec<_>>();
      writeln!(writer, "{},{}", x, ys.join(","))?;
    }

    writer.flush()?;
    Ok(())
  }

  pub fn save_summary_to_csv<P: AsRef<FsPath>>(&self, path: P, x_label: &str) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{x_label},COUNT,MEAN,MEDIAN,STDDEV,MIN,MAX")?;

    let mut xs = self.data_set.keys().copied().collect::<Vec<_>>();
    xs.sort_unstable();
    for x in xs {
      if let Some(y) = self.calculate(x) {
        writeln!(
          writer,
          "\"{}\",{},{:.3},{:.3},{:.3},{:.3},{:.3}",
          x, y.count, y.mean, y.median, y.std_dev, y.min, y.max
        )?;
      }
    }

    writer.flush()?;
    Ok(())
  }
}

/// Durations of hashing passes and of the flushes they triggered, in milliseconds.
#[derive(Default)]
pub struct HashingStatistics {
  hashes: Mutex<Vec<f64>>,
  flushes: Mutex<Vec<u64>>,
}

impl HashingStatistics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hash(&self, elapsed: Duration) {
    self.hashes.lock().push(elapsed.as_micros() as f64 / 1000.0);
  }

  pub fn hash_stat(&self) -> Stat {
    Stat::from_vec(Unit::Milliseconds, &self.hashes.lock())
  }

  pub fn flush_stat(&self) -> Stat {
    Stat::from_vec(Unit::Milliseconds, &self.flushes.lock())
  }

  pub fn reset(&self) {
    self.hashes.lock().clear();
    self.flushes.lock().clear();
  }
}

impl FlushStatistics for HashingStatistics {
  fn record_flush(&self, millis: u64) {
    self.flushes.lock().push(millis);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stat_of_samples() {
    let stat = Stat::from_vec(Unit::Milliseconds, &[4.0, 1.0, 3.0, 2.0]);
    assert_eq!(4, stat.count);
    assert_eq!(2.5, stat.mean);
    assert_eq!(2.5, stat.median);
    assert_eq!(1.0, stat.min);
    assert_eq!(4.0, stat.max);
    assert!((stat.std_dev - 1.25f64.sqrt()).abs() < 1e-12);

    let stat = Stat::from_vec(Unit::Bytes, &[5u64, 1, 9]);
    assert_eq!(5.0, stat.median);
    assert_eq!("3: 5.00B ±130.6% [1|5|9]", stat.to_string());

    let stat = Stat::from_vec::<u64>(Unit::Count, &[]);
    assert_eq!(0, stat.count);
    assert!(stat.mean.is_nan());
  }

  #[test]
  fn units_scale_values() {
    assert_eq!("1.50kB", Unit::Bytes.format(1536.0));
    assert_eq!("2.00ms", Unit::Milliseconds.format(2.0));
    assert_eq!("250μ", Unit::Milliseconds.short(0.25));
    assert_eq!("12.00k", Unit::Count.format(12_000.0));
  }

  #[test]
  fn report_writes_csv() {
    let dir = tempfile::tempdir().unwrap();
    let mut report = Report::new(Unit::Milliseconds);
    report.add(20u64, 2.0);
    report.add(10u64, 1.0);
    let stat = report.append(10u64, vec![3.0]);
    assert_eq!(2, stat.count);
    assert_eq!(2.0, stat.mean);
    assert!(report.calculate(30).is_none());

    let path = dir.path().join("xy.csv");
    report.save_xy_to_csv(&path, "N", "TIME").unwrap();
    assert_eq!("N,TIME\n10,1,3\n20,2\n", std::fs::read_to_string(&path).unwrap());

    let path = dir.path().join("summary.csv");
    report.save_summary_to_csv(&path, "N").unwrap();
    let summary = std::fs::read_to_string(&path).unwrap();
    assert_eq!(3, summary.lines().count());
    assert!(summary.lines().nth(1).unwrap().starts_with("\"10\",2,2.000,2.000,1.000,1.000,3.000"));
  }

  #[test]
  fn hashing_statistics_collect_both_kinds() {
    let statistics = HashingStatistics::new();
    statistics.record_hash(Duration::from_millis(3));
    statistics.record_flush(7);
    statistics.record_flush(9);
    assert_eq!(1, statistics.hash_stat().count);
    assert_eq!(3.0, statistics.hash_stat().mean);
    assert_eq!(8.0, statistics.flush_stat().mean);
    statistics.reset();
    assert_eq!(0, statistics.flush_stat().count);
  }
}
