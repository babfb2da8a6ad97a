//! The scheduling policies that feed the simulation.
//!
//! [`Scheduler`] is the capability interface every policy implements, and it
//! carries the placement primitives (suitable-node search, generalized and
//! compact allocation, waiting-queue reordering) the concrete policies build
//! on. Policies hold only their own tuning state; cluster, database and
//! trace are borrowed from the engine for the duration of a pass through
//! [`EngineCtx`].

pub mod conservative;
pub mod coscheduler;
pub mod easy;
pub mod fifo;
pub mod ranks;

use crate::cluster::host::Host;
use crate::cluster::Cluster;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::jobs::Job;

pub trait Scheduler: Send {
    /// Human-readable policy name used in traces and reports.
    fn name(&self) -> &'static str;

    /// Invoked once before the first step.
    fn setup(&mut self, _ctx: &mut EngineCtx<'_>) -> Result<(), SimError> {
        Ok(())
    }

    /// Start as many waiting jobs as the policy permits. Returns whether
    /// the execution list changed. Must not advance the clock.
    fn deploy(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError>;

    /// Called after `deploy` when backfilling is enabled.
    fn backfill(&mut self, _ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        Ok(false)
    }

    /// Sort key applied in descending order to the waiting queue before
    /// each pass.
    fn waiting_queue_reorder(&self, _cluster: &Cluster, _job: &Job) -> f64 {
        1.0
    }

    /// Which hosts to prefer during allocation; higher goes first.
    fn host_alloc_condition(&self, _host: &Host, _job: &Job) -> f64 {
        1.0
    }

    /// Place the waiting job at `wq_idx` with `socket_conf[i]` cores on
    /// socket `i` of each chosen host. Atomic: either the job is reserved
    /// and appended to the execution list, or nothing changes and `false`
    /// comes back.
    fn allocation(
        &self,
        ctx: &mut EngineCtx<'_>,
        wq_idx: usize,
        socket_conf: &[u32],
    ) -> Result<bool, SimError> {
        let job = &ctx.cluster.waiting_queue[wq_idx];

        let suitable = ctx
            .cluster
            .find_suitable_nodes(job.num_of_processes, socket_conf);
        if suitable.is_empty() {
            return Ok(false);
        }

        // stable descending sort keeps host order deterministic among ties
        let mut rated: Vec<(f64, (String, Vec<procset::ProcSet>))> = suitable
            .into_iter()
            .map(|entry| {
                let host = ctx.cluster.host(&entry.0).expect("suitable host exists");
                (self.host_alloc_condition(host, job), entry)
            })
            .collect();
        rated.sort_by(|a, b| b.0.total_cmp(&a.0));

        let needed_ppn: u32 = socket_conf.iter().sum();
        let needed_hosts = job.num_of_processes.div_ceil(needed_ppn) as usize;
        let chosen: Vec<_> = rated
            .into_iter()
            .take(needed_hosts)
            .map(|(_, entry)| entry)
            .collect();
        if chosen.len() < needed_hosts {
            return Ok(false);
        }

        ctx.deploy_job_to_hosts(&chosen, wq_idx)?;
        Ok(true)
    }

    /// Compact and exclusive allocation using the full socket
    /// configuration.
    fn compact_allocation(&self, ctx: &mut EngineCtx<'_>, wq_idx: usize) -> Result<bool, SimError> {
        let socket_conf = ctx.cluster.full_socket_allocation();
        self.allocation(ctx, wq_idx, &socket_conf)
    }

    /// Stable re-sort of the waiting queue, descending by
    /// [`Scheduler::waiting_queue_reorder`].
    fn reorder_waiting_queue(&self, ctx: &mut EngineCtx<'_>) {
        let queue = std::mem::take(&mut ctx.cluster.waiting_queue);
        let mut keyed: Vec<(f64, Job)> = queue
            .into_iter()
            .map(|job| (self.waiting_queue_reorder(ctx.cluster, &job), job))
            .collect();
        keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
        ctx.cluster.waiting_queue = keyed.into_iter().map(|(_, job)| job).collect();
    }
}

/// Instantiate a policy by name. Accepts the canonical names used in traces
/// as well as kebab-case shorthands.
pub fn from_name(name: &str, backfill_enabled: bool) -> Result<Box<dyn Scheduler>, SimError> {
    let normalized = name.to_ascii_lowercase();
    match normalized.as_str() {
        "fifo" | "fifo scheduler" => Ok(Box::new(fifo::Fifo)),
        "easy" | "easy scheduler" => Ok(Box::new(easy::Easy::default())),
        "conservative" | "conservative scheduler" => {
            Ok(Box::new(conservative::Conservative::default()))
        }
        "filler-ranks" | "filler ranks co-scheduler" => {
            let mut sched = ranks::filler::FillerRanks::default();
            sched.config.backfill_enabled = backfill_enabled;
            Ok(Box::new(sched))
        }
        "random-ranks" | "random ranks co-scheduler" => {
            let mut sched = ranks::random::RandomRanks::default();
            sched.config.backfill_enabled = backfill_enabled;
            Ok(Box::new(sched))
        }
        _ => Err(SimError::Config(format!("unknown scheduler {name:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_aliases() {
        assert_eq!(from_name("fifo", false).unwrap().name(), "FIFO Scheduler");
        assert_eq!(
            from_name("EASY Scheduler", true).unwrap().name(),
            "EASY Scheduler"
        );
        assert_eq!(
            from_name("random-ranks", true).unwrap().name(),
            "Random Ranks Co-Scheduler"
        );
        assert!(from_name("banker", false).is_err());
    }
}
