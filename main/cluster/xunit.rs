//! Execution units: ordered groups of co-running jobs on a shared set of
//! processors.

use procset::ProcSet;

use crate::jobs::Job;

/// An ordered list of jobs plus an optional trailing idle job. The first
/// job is the head (largest resource holder); later jobs are co-located
/// tails holding disjoint processors; the idle job, if present, carries the
/// processors still reserved for this unit's future expansion.
#[derive(Debug, Clone, Default)]
pub struct ExecUnit {
    pub jobs: Vec<Job>,
}

impl ExecUnit {
    pub fn singleton(job: Job) -> Self {
        Self { jobs: vec![job] }
    }

    pub fn head(&self) -> &Job {
        &self.jobs[0]
    }

    /// A unit is filled once no idle job remains.
    pub fn is_filled(&self) -> bool {
        self.idle_tail().is_none()
    }

    pub fn idle_tail(&self) -> Option<&Job> {
        self.jobs.last().filter(|j| j.is_idle())
    }

    pub fn real_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| !j.is_idle())
    }

    pub fn real_jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut().filter(|j| !j.is_idle())
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.jobs.iter().any(|j| !j.is_idle() && j.job_id == job_id)
    }

    /// Union of all members' processors, idle tail included.
    pub fn cores(&self) -> ProcSet {
        self.jobs
            .iter()
            .fold(ProcSet::new(), |acc, j| &acc | &j.assigned_cores)
    }

    /// Drop the idle tail and hand back its processors, if any.
    pub fn take_idle_tail(&mut self) -> Option<Job> {
        if self.idle_tail().is_some() {
            self.jobs.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_tail_handling() {
        let mut job = Job::new(0, "a", 4, 10.0, 0.0, 20.0);
        job.assigned_cores = "0-3".parse().unwrap();
        let idle = Job::idle("4-7".parse().unwrap());

        let mut unit = ExecUnit { jobs: vec![job, idle] };
        assert!(!unit.is_filled());
        assert_eq!(unit.cores(), "0-7".parse().unwrap());
        assert_eq!(unit.real_jobs().count(), 1);

        let tail = unit.take_idle_tail().unwrap();
        assert_eq!(tail.assigned_cores, "4-7".parse().unwrap());
        assert!(unit.is_filled());
        assert!(unit.take_idle_tail().is_none());
    }

    #[test]
    fn test_contains_ignores_idle() {
        let unit = ExecUnit::singleton(Job::idle("0-3".parse().unwrap()));
        assert!(!unit.contains(-1));
    }
}
