//! EASY backfilling: FIFO at the head, plus a reservation for the blocked
//! head job that lets short jobs jump the queue when they cannot delay it.

use crate::cluster::Cluster;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::logger::DeployKind;
use crate::scheduler::Scheduler;

pub struct Easy {
    pub backfill_depth: usize,
}

impl Default for Easy {
    fn default() -> Self {
        Self { backfill_depth: 100 }
    }
}

/// Earliest future time at which enough processors for `req_cores` will be
/// free, assuming every executing job runs to its projected completion.
pub(crate) fn reservation_time(cluster: &Cluster, req_cores: u32) -> Option<f64> {
    let mut free = cluster.get_idle_cores();
    if free >= req_cores {
        return Some(cluster.makespan);
    }

    let mut releases: Vec<(f64, u32)> = Vec::new();
    for unit in &cluster.execution_list {
        for job in unit.real_jobs() {
            releases.push((cluster.makespan + job.remaining_time, job.assigned_cores.len()));
        }
    }
    releases.sort_by(|a, b| a.0.total_cmp(&b.0));

    for (at, cores) in releases {
        free += cores;
        if free >= req_cores {
            return Some(at);
        }
    }
    None
}

impl Scheduler for Easy {
    fn name(&self) -> &'static str {
        "EASY Scheduler"
    }

    fn deploy(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        let mut changed = false;
        while !ctx.cluster.waiting_queue.is_empty() {
            if self.compact_allocation(ctx, 0)? {
                ctx.logger.count_deploy(DeployKind::Compact);
                changed = true;
            } else {
                ctx.logger.count_deploy_failed();
                break;
            }
        }
        Ok(changed)
    }

    /// The head keeps its reservation; the next `backfill_depth` jobs may
    /// start now if they fit in the free processors and declare a wall time
    /// that ends before the reservation is due.
    fn backfill(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        if ctx.cluster.waiting_queue.len() < 2 {
            return Ok(false);
        }

        let head_req = ctx.cluster.waiting_queue[0].num_of_processes;
        let Some(reservation) = reservation_time(ctx.cluster, head_req) else {
            return Ok(false);
        };
        let window = reservation - ctx.cluster.makespan;

        let mut changed = false;
        let mut idx = 1;
        let mut scanned = 0;
        while idx < ctx.cluster.waiting_queue.len() && scanned < self.backfill_depth {
            scanned += 1;
            let candidate_fits = ctx.cluster.waiting_queue[idx].wall_time <= window;
            if candidate_fits && self.compact_allocation(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::Compact);
                changed = true;
                // the queue shrank under idx; the next candidate slid into
                // its place
            } else {
                idx += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::database::{test_heatmap, Database};
    use crate::engine::ComputeEngine;
    use crate::jobs::Job;
    use crate::logger::Logger;

    fn run(nodes: u32, jobs: Vec<Job>) -> ComputeEngine {
        let names: Vec<_> = jobs.iter().map(|j| j.job_name.clone()).collect();
        let entries: Vec<(&str, &str, Option<f64>)> =
            names.iter().map(|n| (n.as_str(), n.as_str(), Some(1.0))).collect();
        let mut eng = ComputeEngine::new(
            Database::new(jobs, test_heatmap(&entries)),
            Cluster::new(nodes, vec![4]),
            Box::new(Easy::default()),
            Logger::new("EASY Scheduler"),
            true,
        );
        eng.run().unwrap();
        eng
    }

    #[test]
    fn test_short_job_backfills_into_free_node() {
        // 3 nodes x (4,): A takes two nodes for 10s; B fits the third
        // immediately and finishes well before A releases anything
        let eng = run(
            3,
            vec![
                Job::new(0, "A", 8, 10.0, 0.0, 10.0),
                Job::new(1, "B", 4, 1.0, 0.0, 1.0),
            ],
        );
        assert_eq!(eng.logger.job_events["1:B"].start_time, 0.0);
        assert_eq!(eng.cluster.makespan, 10.0);
    }

    #[test]
    fn test_backfill_respects_head_reservation() {
        // 2 nodes x (4,): A holds everything for 10s, C (head) then needs
        // both nodes; B's wall time exceeds the zero-length window left by
        // C's reservation, so B cannot jump ahead
        let eng = run(
            2,
            vec![
                Job::new(0, "A", 8, 10.0, 0.0, 10.0),
                Job::new(1, "C", 8, 5.0, 0.0, 5.0),
                Job::new(2, "B", 4, 4.0, 0.0, 4.0),
            ],
        );
        assert_eq!(eng.logger.job_events["1:C"].start_time, 10.0);
        assert_eq!(eng.logger.job_events["2:B"].start_time, 15.0);
    }

    #[test]
    fn test_backfill_window_admits_short_wall_time() {
        // 2 nodes x (4,): A holds one node for 10s, head H needs both
        // nodes, so one node stays free until t=10; B declares a 2s wall
        // time and slips in
        let eng = run(
            2,
            vec![
                Job::new(0, "A", 4, 10.0, 0.0, 10.0),
                Job::new(1, "H", 8, 5.0, 0.0, 5.0),
                Job::new(2, "B", 4, 2.0, 0.0, 2.0),
            ],
        );
        assert_eq!(eng.logger.job_events["2:B"].start_time, 0.0);
        assert_eq!(eng.logger.job_events["1:H"].start_time, 10.0);
        assert_eq!(eng.cluster.makespan, 15.0);
    }

    #[test]
    fn test_reservation_time_accumulates_releases() {
        let mut cluster = Cluster::new(2, vec![4]);
        let mut a = Job::new(0, "A", 4, 3.0, 0.0, 6.0);
        a.assigned_cores = "0-3".parse().unwrap();
        let mut b = Job::new(1, "B", 4, 7.0, 0.0, 14.0);
        b.assigned_cores = "4-7".parse().unwrap();
        cluster.reserve("0:A", &a.assigned_cores);
        cluster.reserve("1:B", &b.assigned_cores);
        cluster
            .execution_list
            .push(crate::cluster::xunit::ExecUnit::singleton(a));
        cluster
            .execution_list
            .push(crate::cluster::xunit::ExecUnit::singleton(b));

        assert_eq!(reservation_time(&cluster, 0), Some(0.0));
        assert_eq!(reservation_time(&cluster, 4), Some(3.0));
        assert_eq!(reservation_time(&cluster, 8), Some(7.0));
        assert_eq!(reservation_time(&cluster, 9), None);
    }
}
