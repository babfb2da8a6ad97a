//! Filler ranks: prefer the waiting jobs that most exactly close the
//! current idle-core gaps of the system.

use crate::cluster::xunit::ExecUnit;
use crate::cluster::Cluster;
use crate::database::Heatmap;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::jobs::Job;
use crate::scheduler::coscheduler::{Coscheduler, CoschedulerConfig};
use crate::scheduler::Scheduler;

#[derive(Default)]
pub struct FillerRanks {
    pub config: CoschedulerConfig,
}

impl Scheduler for FillerRanks {
    fn name(&self) -> &'static str {
        "Filler Ranks Co-Scheduler"
    }

    fn deploy(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        self.deploy_cascade(ctx)
    }

    /// The job that comes closest to covering the free cores wins; early
    /// submitters break ties.
    fn waiting_queue_reorder(&self, cluster: &Cluster, job: &Job) -> f64 {
        let free = cluster.get_idle_cores();
        let factor0 = if free > 0 {
            let diff = i64::from(free) - i64::from(job.num_of_processes);
            if diff > 0 {
                1.0 - diff as f64 / f64::from(free)
            } else if diff == 0 {
                1.0
            } else {
                -1.0
            }
        } else {
            1.0
        };

        let factor1 = (job.job_id + 1) as f64 / cluster.waiting_queue.len().max(1) as f64;
        factor0 / factor1
    }
}

impl Coscheduler for FillerRanks {
    fn config(&self) -> &CoschedulerConfig {
        &self.config
    }

    /// Prefer partners leaving the smallest idle remainder in the pair's
    /// reservation.
    fn waiting_job_candidates_reorder(
        &self,
        _heatmap: &Heatmap,
        _cluster: &Cluster,
        job: &Job,
        co_job: &Job,
    ) -> f64 {
        let leftover = job.half_node_cores.abs_diff(co_job.half_node_cores);
        1.0 / (1.0 + f64::from(leftover))
    }

    /// Prefer units whose idle reservation the job fills most tightly.
    fn xunit_candidates_reorder(
        &self,
        _heatmap: &Heatmap,
        _cluster: &Cluster,
        job: &Job,
        xunit: &ExecUnit,
    ) -> f64 {
        let idle = xunit.idle_tail().map_or(0, |i| i.assigned_cores.len());
        let gap = idle.saturating_sub(job.half_node_cores);
        1.0 / (1.0 + f64::from(gap))
    }
}
