//! The job record: immutable identity plus the mutable runtime state the
//! scheduler and compute engine act on.

use procset::ProcSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::SimError;

/// Sentinel ID for the idle job that carries the unused processors of an
/// execution unit.
pub const IDLE_JOB_ID: i64 = -1;

/// Finish time before a job has finished.
pub const UNFINISHED: f64 = -1.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Executing,
    Finished,
    Failed,
    Aborted,
}

/// How a job reacts to sharing the memory fabric, as derived from its
/// speedup profile. Schedulers may use it to bias placement decisions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobCharacter {
    Compact,
    Spread,
    Robust,
    Frail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    // identity
    pub job_id: i64,
    pub job_name: String,

    // requested resources
    pub num_of_processes: u32,
    /// Process count rounded up to whole nodes, in cores. Computed at engine
    /// setup from the cluster geometry.
    #[serde(default)]
    pub full_node_cores: u32,
    /// Process count rounded up to half nodes, in cores; the footprint the
    /// job holds when co-located or spread.
    #[serde(default)]
    pub half_node_cores: u32,

    // timing
    pub remaining_time: f64,
    pub submit_time: f64,
    pub waiting_time: f64,
    pub wall_time: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default = "unfinished")]
    pub finish_time: f64,

    // speedup profile
    #[serde(default = "one")]
    pub sim_speedup: f64,
    #[serde(default = "one")]
    pub avg_speedup: f64,
    #[serde(default = "one")]
    pub max_speedup: f64,
    #[serde(default = "one")]
    pub min_speedup: f64,

    // runtime state
    #[serde(default = "empty_hosts")]
    pub assigned_hosts: BTreeSet<String>,
    #[serde(default)]
    pub assigned_cores: ProcSet,
    #[serde(default = "pending")]
    pub state: JobState,
    #[serde(default = "compact")]
    pub job_character: JobCharacter,
    /// Scheduling rounds spent at the head of the waiting queue.
    #[serde(default)]
    pub age: u32,
}

fn one() -> f64 {
    1.0
}

fn unfinished() -> f64 {
    UNFINISHED
}

fn pending() -> JobState {
    JobState::Pending
}

fn compact() -> JobCharacter {
    JobCharacter::Compact
}

fn empty_hosts() -> BTreeSet<String> {
    BTreeSet::new()
}

impl Job {
    pub fn new(
        job_id: i64,
        job_name: impl Into<String>,
        num_of_processes: u32,
        remaining_time: f64,
        submit_time: f64,
        wall_time: f64,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            num_of_processes,
            full_node_cores: 0,
            half_node_cores: 0,
            remaining_time,
            submit_time,
            waiting_time: 0.0,
            wall_time,
            start_time: 0.0,
            finish_time: UNFINISHED,
            sim_speedup: 1.0,
            avg_speedup: 1.0,
            max_speedup: 1.0,
            min_speedup: 1.0,
            assigned_hosts: BTreeSet::new(),
            assigned_cores: ProcSet::new(),
            state: JobState::Pending,
            job_character: JobCharacter::Compact,
            age: 0,
        }
    }

    /// The idle job: a sentinel that owns the still-unused processors
    /// reserved for an execution unit's future expansion.
    pub fn idle(cores: ProcSet) -> Self {
        let mut job = Job::new(IDLE_JOB_ID, "idle", cores.len(), -1.0, 0.0, 0.0);
        job.assigned_cores = cores;
        job
    }

    pub fn is_idle(&self) -> bool {
        self.job_id == IDLE_JOB_ID
    }

    /// Unique key used by hosts and the trace: `"<id>:<name>"`.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.job_id, self.job_name)
    }

    /// Rescale the remaining wall time from the current speedup to
    /// `new_speedup` and adopt it as the effective speedup. Called whenever
    /// the set of co-location partners changes.
    pub fn rescale_speedup(&mut self, new_speedup: f64) -> Result<(), SimError> {
        if !(new_speedup > 0.0) || !new_speedup.is_finite() {
            return Err(SimError::NonconvergentSpeedup {
                job: self.signature(),
                speedup: new_speedup,
            });
        }
        self.remaining_time *= self.sim_speedup / new_speedup;
        self.sim_speedup = new_speedup;
        Ok(())
    }

    /// Compute the whole/half node footprints for a node of `cores_per_node`
    /// cores.
    pub fn bind_node_geometry(&mut self, cores_per_node: u32) {
        let half = (cores_per_node / 2).max(1);
        self.full_node_cores = self.num_of_processes.div_ceil(cores_per_node) * cores_per_node;
        self.half_node_cores = self.num_of_processes.div_ceil(half) * half;
    }
}

/// Identity, resources and timing decide equality; transient placement state
/// does not.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
            && self.job_name == other.job_name
            && self.num_of_processes == other.num_of_processes
            && self.remaining_time == other.remaining_time
            && self.submit_time == other.submit_time
            && self.wall_time == other.wall_time
            && self.start_time == other.start_time
            && self.sim_speedup == other.sim_speedup
            && self.avg_speedup == other.avg_speedup
            && self.max_speedup == other.max_speedup
            && self.min_speedup == other.min_speedup
            && self.job_character == other.job_character
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature() {
        let job = Job::new(3, "lu.C.64", 64, 100.0, 0.0, 200.0);
        assert_eq!(job.signature(), "3:lu.C.64");
    }

    #[test]
    fn test_idle_job_derives_process_count() {
        let idle = Job::idle("0-7 16-19".parse().unwrap());
        assert!(idle.is_idle());
        assert_eq!(idle.num_of_processes, 12);
        assert_eq!(idle.remaining_time, -1.0);
        assert_eq!(idle.signature(), "-1:idle");
    }

    #[test]
    fn test_rescale_speedup_grows_remaining_on_slowdown() {
        let mut job = Job::new(0, "a", 4, 10.0, 0.0, 20.0);
        job.rescale_speedup(0.8).unwrap();
        assert!((job.remaining_time - 12.5).abs() < 1e-9);
        assert_eq!(job.sim_speedup, 0.8);

        // back to the baseline restores the original remaining time
        job.rescale_speedup(1.0).unwrap();
        assert!((job.remaining_time - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rescale_speedup_rejects_nonconvergent() {
        let mut job = Job::new(0, "a", 4, 10.0, 0.0, 20.0);
        assert!(job.rescale_speedup(0.0).is_err());
        assert!(job.rescale_speedup(-1.0).is_err());
        assert!(job.rescale_speedup(f64::NAN).is_err());
    }

    #[test]
    fn test_node_geometry() {
        let mut job = Job::new(0, "a", 6, 10.0, 0.0, 20.0);
        job.bind_node_geometry(8);
        assert_eq!(job.full_node_cores, 8);
        assert_eq!(job.half_node_cores, 8);

        let mut job = Job::new(0, "a", 4, 10.0, 0.0, 20.0);
        job.bind_node_geometry(8);
        assert_eq!(job.full_node_cores, 8);
        assert_eq!(job.half_node_cores, 4);

        let mut job = Job::new(0, "a", 16, 10.0, 0.0, 20.0);
        job.bind_node_geometry(8);
        assert_eq!(job.full_node_cores, 16);
        assert_eq!(job.half_node_cores, 16);
    }

    #[test]
    fn test_equality_ignores_placement() {
        let a = Job::new(1, "a", 4, 10.0, 0.0, 20.0);
        let mut b = a.clone();
        b.assigned_hosts.insert("host0".into());
        b.assigned_cores = "0-3".parse().unwrap();
        assert_eq!(a, b);

        let mut c = a.clone();
        c.remaining_time = 5.0;
        assert_ne!(a, c);
    }
}
