//! The database owns the preloaded job queue and the pairwise speedup
//! heatmap that drives co-location decisions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::jobs::Job;

/// Outcome of a heatmap lookup. Co-location admission needs both directions
/// of a pairing to be [`PairSpeedup::Defined`]; anything else makes the
/// pairing ineligible rather than raising an error.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PairSpeedup {
    /// Both job kinds are known and the pairing has been measured.
    Defined(f64),
    /// Both job kinds are known but the pairing was never measured (`null`
    /// in the heatmap file).
    Undefined,
    /// At least one job kind does not appear in the heatmap at all.
    NotRepresented,
}

impl PairSpeedup {
    pub fn value(self) -> Option<f64> {
        match self {
            PairSpeedup::Defined(x) => Some(x),
            _ => None,
        }
    }
}

/// Speedup factor applied to a job kind's remaining time when co-located
/// with a partner kind. Shaped symmetric, valued asymmetric: both
/// `heatmap[a][b]` and `heatmap[b][a]` exist as keys, but their values
/// usually differ.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heatmap {
    // BTreeMaps keep row/column iteration deterministic
    rows: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

impl Heatmap {
    pub fn new(rows: BTreeMap<String, BTreeMap<String, Option<f64>>>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Three-valued lookup of the speedup `job` experiences next to
    /// `co_job`.
    pub fn get(&self, job: &str, co_job: &str) -> PairSpeedup {
        match self.rows.get(job) {
            None => PairSpeedup::NotRepresented,
            Some(row) => match row.get(co_job) {
                None => PairSpeedup::NotRepresented,
                Some(None) => PairSpeedup::Undefined,
                Some(Some(x)) => PairSpeedup::Defined(*x),
            },
        }
    }

    /// Arithmetic mean of the two directions of a pairing, or `None` unless
    /// both are defined.
    pub fn pair_mean(&self, a: &str, b: &str) -> Option<f64> {
        let ab = self.get(a, b).value()?;
        let ba = self.get(b, a).value()?;
        Some((ab + ba) / 2.0)
    }

    /// Job kinds represented in the heatmap, in deterministic order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    /// `(max, avg, min)` over the defined entries of a kind's row, with the
    /// diagonal standing in for the best solo speedup. All three default to
    /// 1.0 when nothing is defined.
    pub fn row_profile(&self, job: &str) -> (f64, f64, f64) {
        let max = self.get(job, job).value().unwrap_or(1.0);

        let defined: Vec<f64> = self
            .rows
            .get(job)
            .map(|row| row.values().filter_map(|v| *v).collect())
            .unwrap_or_default();

        if defined.is_empty() {
            return (max, 1.0, 1.0);
        }
        let avg = defined.iter().sum::<f64>() / defined.len() as f64;
        let min = defined.iter().cloned().fold(f64::INFINITY, f64::min);
        (max, avg, min)
    }
}

/// Preloaded jobs in submission order plus the heatmap they were profiled
/// against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Database {
    pub preloaded_queue: Vec<Job>,
    pub heatmap: Heatmap,
}

impl Database {
    pub fn new(preloaded_queue: Vec<Job>, heatmap: Heatmap) -> Self {
        Self {
            preloaded_queue,
            heatmap,
        }
    }

    /// Fill in the per-job speedup profile from the heatmap for jobs that
    /// did not arrive with one.
    pub fn setup(&mut self) {
        for job in &mut self.preloaded_queue {
            let (max, avg, min) = self.heatmap.row_profile(&job.job_name);
            if job.max_speedup == 1.0 {
                job.max_speedup = max;
            }
            if job.avg_speedup == 1.0 {
                job.avg_speedup = avg;
            }
            if job.min_speedup == 1.0 {
                job.min_speedup = min;
            }
        }
    }
}

/// Build a small heatmap from `(job, co_job, value)` triples in tests.
#[cfg(test)]
pub(crate) fn test_heatmap(entries: &[(&str, &str, Option<f64>)]) -> Heatmap {
    let mut rows: BTreeMap<String, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    for &(a, b, v) in entries {
        rows.entry(a.into()).or_default().insert(b.into(), v);
    }
    Heatmap::new(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_heatmap as heatmap;

    #[test]
    fn test_three_valued_lookup() {
        let hm = heatmap(&[("a", "a", Some(1.0)), ("a", "b", None)]);
        assert_eq!(hm.get("a", "a"), PairSpeedup::Defined(1.0));
        assert_eq!(hm.get("a", "b"), PairSpeedup::Undefined);
        assert_eq!(hm.get("a", "c"), PairSpeedup::NotRepresented);
        assert_eq!(hm.get("z", "a"), PairSpeedup::NotRepresented);
    }

    #[test]
    fn test_pair_mean_needs_both_directions() {
        let hm = heatmap(&[
            ("a", "b", Some(0.8)),
            ("b", "a", Some(0.9)),
            ("a", "c", Some(0.5)),
        ]);
        assert!((hm.pair_mean("a", "b").unwrap() - 0.85).abs() < 1e-12);
        assert_eq!(hm.pair_mean("a", "c"), None);
    }

    #[test]
    fn test_row_profile() {
        let hm = heatmap(&[
            ("a", "a", Some(1.2)),
            ("a", "b", Some(0.8)),
            ("a", "c", None),
        ]);
        let (max, avg, min) = hm.row_profile("a");
        assert_eq!(max, 1.2);
        assert!((avg - 1.0).abs() < 1e-12);
        assert_eq!(min, 0.8);

        assert_eq!(hm.row_profile("missing"), (1.0, 1.0, 1.0));
    }

    #[test]
    fn test_database_setup_pulls_profile() {
        let hm = heatmap(&[("a", "a", Some(1.5)), ("a", "b", Some(0.7))]);
        let mut db = Database::new(vec![Job::new(0, "a", 4, 10.0, 0.0, 20.0)], hm);
        db.setup();
        let job = &db.preloaded_queue[0];
        assert_eq!(job.max_speedup, 1.5);
        assert!((job.avg_speedup - 1.1).abs() < 1e-12);
        assert_eq!(job.min_speedup, 0.7);
    }
}
