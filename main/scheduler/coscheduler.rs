//! The co-scheduler base: the placement cascade shared by every policy that
//! pairs jobs on the memory fabric.
//!
//! For each candidate from the reordered waiting queue the cascade tries, in
//! order: joining an execution unit that still has an idle reservation,
//! pairing with another waiting job on fresh nodes, spreading alone over a
//! double-width reservation, and finally the plain compact allocation.
//! Admission into any shared placement requires both heatmap directions of
//! the pairing to be known and their mean to beat the speedup threshold.

use procset::ProcSet;

use crate::cluster::xunit::ExecUnit;
use crate::cluster::Cluster;
use crate::database::Heatmap;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::jobs::{Job, IDLE_JOB_ID};
use crate::logger::DeployKind;
use crate::scheduler::Scheduler;

/// Tuning knobs common to the co-scheduler family.
#[derive(Debug, Clone)]
pub struct CoschedulerConfig {
    pub backfill_enabled: bool,
    pub backfill_depth: usize,
    /// Force the head of the queue into a compact allocation once it has
    /// waited this many rounds.
    pub aging_enabled: bool,
    pub age_limit: u32,
    /// Minimum pair-averaged speedup a co-location must promise.
    pub speedup_threshold: f64,
    /// Spread placements are only allowed while utilization stays at or
    /// below this fraction.
    pub system_utilization: f64,
    /// How far into the waiting queue to look for pairing partners; `None`
    /// scans the whole queue.
    pub queue_depth: Option<usize>,
}

impl Default for CoschedulerConfig {
    fn default() -> Self {
        Self {
            backfill_enabled: false,
            backfill_depth: 100,
            aging_enabled: false,
            age_limit: 10,
            speedup_threshold: 1.0,
            system_utilization: 1.0,
            queue_depth: None,
        }
    }
}

/// A learned stand-in for missing heatmap entries.
pub trait SpeedupModel: Send {
    fn predict(&self, tag: &str, co_tag: &str) -> f64;
}

/// Take `req_cores` out of `pool` in half-node slices: whole intervals that
/// are exactly a half node, and the first half of every node inside larger
/// intervals. Falls back to arbitrary remaining IDs if the pool is too
/// fragmented for clean slices.
pub(crate) fn half_node_chunks(pool: &ProcSet, req_cores: u32, half_node: u32) -> ProcSet {
    let mut out = ProcSet::new();
    let mut left = req_cores;

    for interval in pool.intervals() {
        if left == 0 {
            break;
        }
        let count = interval.count();
        if count == half_node {
            out |= &ProcSet::from_range(interval.lo, interval.hi);
            left = left.saturating_sub(half_node);
        } else if count > half_node {
            let mut lo = interval.lo;
            while left > 0 && lo + half_node - 1 <= interval.hi {
                out |= &ProcSet::from_range(lo, lo + half_node - 1);
                left = left.saturating_sub(half_node);
                match lo.checked_add(2 * half_node) {
                    Some(next) => lo = next,
                    None => break,
                }
            }
        }
    }

    if left > 0 {
        let rest = pool - &out;
        out |= &rest.take(left);
    }
    out
}

/// Real (non-idle) job names resident on a host, from its signature map.
fn resident_names(host: &crate::cluster::host::Host) -> Vec<String> {
    host.jobs
        .keys()
        .filter_map(|sig| {
            let (id, name) = sig.split_once(':')?;
            let id: i64 = id.parse().ok()?;
            (id != IDLE_JOB_ID).then(|| name.to_string())
        })
        .collect()
}

pub trait Coscheduler: Scheduler {
    fn config(&self) -> &CoschedulerConfig;

    /// Learned engine substituting for missing heatmap entries.
    fn speedup_model(&self) -> Option<&dyn SpeedupModel> {
        None
    }

    /// Rank a waiting-job pairing partner; the maximum wins.
    fn waiting_job_candidates_reorder(
        &self,
        heatmap: &Heatmap,
        cluster: &Cluster,
        job: &Job,
        co_job: &Job,
    ) -> f64;

    /// Rank an execution unit as a co-location target; the maximum wins.
    fn xunit_candidates_reorder(
        &self,
        heatmap: &Heatmap,
        cluster: &Cluster,
        job: &Job,
        xunit: &ExecUnit,
    ) -> f64;

    /// Post-hook after every successful placement, for fragmentation
    /// bookkeeping that feeds the next pass's sort keys.
    fn after_deployment(&mut self, _ctx: &mut EngineCtx<'_>) {}

    /// Directional speedup of `a` next to `b`, from the heatmap or the
    /// learned model.
    fn pair_value(&self, heatmap: &Heatmap, a: &str, b: &str) -> Option<f64> {
        match heatmap.get(a, b).value() {
            Some(v) => Some(v),
            None => self.speedup_model().map(|m| m.predict(a, b)),
        }
    }

    /// Mean of both directions of a pairing; `None` unless both are known.
    fn pair_admissible_mean(&self, heatmap: &Heatmap, a: &str, b: &str) -> Option<f64> {
        Some((self.pair_value(heatmap, a, b)? + self.pair_value(heatmap, b, a)?) / 2.0)
    }

    /// The non-filled execution unit that best suits `job`, if any passes
    /// the admission gate.
    fn best_xunit_candidate(
        &self,
        cluster: &Cluster,
        heatmap: &Heatmap,
        job: &Job,
    ) -> Option<usize> {
        let mut best: Option<(f64, usize)> = None;

        for unit_idx in cluster.nonfilled_xunits() {
            let unit = &cluster.execution_list[unit_idx];
            let head = unit.head();
            let idle_cores = unit.idle_tail().map_or(0, |idle| idle.assigned_cores.len());
            if job.half_node_cores > idle_cores {
                continue;
            }

            // joining as a tail is gated on the head; joining as the new
            // head is gated on the worst pairing inside the unit
            let gate = if head.assigned_cores.len() >= idle_cores {
                self.pair_admissible_mean(heatmap, &job.job_name, &head.job_name)
            } else {
                unit.real_jobs()
                    .filter_map(|n| {
                        self.pair_value(heatmap, &job.job_name, &n.job_name)
                            .map(|v| (v, &n.job_name))
                    })
                    .min_by(|a, b| a.0.total_cmp(&b.0))
                    .and_then(|(_, worst)| {
                        self.pair_admissible_mean(heatmap, &job.job_name, worst)
                    })
            };

            match gate {
                Some(mean) if mean > self.config().speedup_threshold => {
                    let score = self.xunit_candidates_reorder(heatmap, cluster, job, unit);
                    if best.map_or(true, |(b, _)| score > b) {
                        best = Some((score, unit_idx));
                    }
                }
                _ => {}
            }
        }

        best.map(|(_, idx)| idx)
    }

    /// Step 1 of the cascade: co-locate onto an existing unit's idle
    /// reservation.
    fn colocation_to_xunit(&self, ctx: &mut EngineCtx<'_>, wq_idx: usize) -> Result<bool, SimError> {
        let database = ctx.database;
        let heatmap = &database.heatmap;

        let candidate = {
            let job = &ctx.cluster.waiting_queue[wq_idx];
            self.best_xunit_candidate(ctx.cluster, heatmap, job)
        };
        let Some(unit_idx) = candidate else {
            return Ok(false);
        };

        let mut job = ctx.cluster.waiting_queue.remove(wq_idx);
        ctx.start_job(&mut job);
        let half = ctx.cluster.half_node_cores();

        let (idle, as_tail) = {
            let unit = &mut ctx.cluster.execution_list[unit_idx];
            let idle = unit.take_idle_tail().expect("candidate unit has an idle tail");
            let as_tail = unit.head().assigned_cores.len() >= idle.assigned_cores.len();
            (idle, as_tail)
        };

        // carve the job's processors out of the idle reservation
        let job_cores = half_node_chunks(&idle.assigned_cores, job.half_node_cores, half);
        job.assigned_cores = job_cores.clone();
        let sig = job.signature();
        ctx.cluster.transfer(&idle.signature(), &job_cores, &sig);
        let parts = ctx.cluster.split_by_host(&job_cores);
        for (hostname, _) in &parts {
            job.assigned_hosts.insert(hostname.clone());
        }

        {
            let unit = &mut ctx.cluster.execution_list[unit_idx];
            if as_tail {
                let head_name = unit.head().job_name.clone();
                if let Some(v) = self.pair_value(heatmap, &job.job_name, &head_name) {
                    job.rescale_speedup(v)?;
                }
                let head = &mut unit.jobs[0];
                if let Some(v) = self.pair_value(heatmap, &head_name, &job.job_name) {
                    if v < head.sim_speedup {
                        head.rescale_speedup(v)?;
                    }
                }
                unit.jobs.push(job.clone());
            } else {
                // the unit's members adapt to their new head, and the head
                // to its worst neighbour
                let mut worst: Option<(f64, String)> = None;
                for xjob in unit.real_jobs_mut() {
                    if let Some(v) = self.pair_value(heatmap, &xjob.job_name, &job.job_name) {
                        xjob.rescale_speedup(v)?;
                    }
                    if let Some(v) = self.pair_value(heatmap, &job.job_name, &xjob.job_name) {
                        if worst.as_ref().map_or(true, |(w, _)| v < *w) {
                            worst = Some((v, xjob.job_name.clone()));
                        }
                    }
                }
                if let Some((v, _)) = worst {
                    job.rescale_speedup(v)?;
                }
                unit.jobs.insert(0, job.clone());
            }

            let idle_left = &idle.assigned_cores - &job_cores;
            debug_assert_eq!(idle_left.len(), idle.assigned_cores.len() - job_cores.len());
            if !idle_left.is_empty() {
                unit.jobs.push(Job::idle(idle_left));
            }
        }

        ctx.log_start(&job, &parts);
        Ok(true)
    }

    /// Step 2 of the cascade: pair with another waiting job on fresh whole
    /// nodes.
    fn colocation_with_wjobs(
        &self,
        ctx: &mut EngineCtx<'_>,
        wq_idx: usize,
    ) -> Result<bool, SimError> {
        let database = ctx.database;
        let heatmap = &database.heatmap;

        let co_idx = {
            let job = &ctx.cluster.waiting_queue[wq_idx];
            if 2 * job.half_node_cores > ctx.cluster.get_idle_cores() {
                return Ok(false);
            }

            let mut best: Option<(f64, usize)> = None;
            let mut scanned = 0usize;
            for (idx, wjob) in ctx.cluster.waiting_queue.iter().enumerate() {
                if idx == wq_idx {
                    continue;
                }
                if let Some(depth) = self.config().queue_depth {
                    if scanned >= depth {
                        break;
                    }
                }
                scanned += 1;

                let Some(mean) = self.pair_admissible_mean(heatmap, &job.job_name, &wjob.job_name)
                else {
                    continue;
                };
                if mean <= self.config().speedup_threshold {
                    continue;
                }
                let need = 2 * job.half_node_cores.max(wjob.half_node_cores);
                if ctx.cluster.assign_nodes(need).is_none() {
                    continue;
                }

                let score = self.waiting_job_candidates_reorder(heatmap, ctx.cluster, job, wjob);
                if best.map_or(true, |(b, _)| score > b) {
                    best = Some((score, idx));
                }
            }
            match best {
                Some((_, idx)) => idx,
                None => return Ok(false),
            }
        };

        // remove the higher index first so the lower one stays valid
        let (mut first, mut second) = if co_idx > wq_idx {
            let co = ctx.cluster.waiting_queue.remove(co_idx);
            (ctx.cluster.waiting_queue.remove(wq_idx), co)
        } else {
            let job = ctx.cluster.waiting_queue.remove(wq_idx);
            (job, ctx.cluster.waiting_queue.remove(co_idx))
        };
        ctx.start_job(&mut first);
        ctx.start_job(&mut second);

        // the larger footprint leads the unit
        let (mut head, mut tail) = if second.half_node_cores > first.half_node_cores {
            (second, first)
        } else {
            (first, second)
        };

        let pool = ctx
            .cluster
            .assign_nodes(2 * head.half_node_cores)
            .expect("candidate scan verified the reservation");
        let half = ctx.cluster.half_node_cores();

        let head_cores = half_node_chunks(&pool, head.half_node_cores, half);
        let rest = &pool - &head_cores;
        let tail_cores = rest.take(tail.half_node_cores);
        let idle_cores = &rest - &tail_cores;
        debug_assert_eq!(
            idle_cores.len(),
            head.half_node_cores - tail.half_node_cores
        );

        if let Some(v) = self.pair_value(heatmap, &head.job_name, &tail.job_name) {
            head.rescale_speedup(v)?;
        }
        if let Some(v) = self.pair_value(heatmap, &tail.job_name, &head.job_name) {
            tail.rescale_speedup(v)?;
        }

        head.assigned_cores = head_cores.clone();
        let head_parts = ctx.cluster.reserve(&head.signature(), &head_cores);
        for (hostname, _) in &head_parts {
            head.assigned_hosts.insert(hostname.clone());
        }

        tail.assigned_cores = tail_cores.clone();
        let tail_parts = ctx.cluster.reserve(&tail.signature(), &tail_cores);
        for (hostname, _) in &tail_parts {
            tail.assigned_hosts.insert(hostname.clone());
        }

        ctx.log_start(&head, &head_parts);
        ctx.log_start(&tail, &tail_parts);

        let mut unit = ExecUnit {
            jobs: vec![head, tail],
        };
        if !idle_cores.is_empty() {
            let idle = Job::idle(idle_cores);
            ctx.cluster.reserve(&idle.signature(), &idle.assigned_cores);
            unit.jobs.push(idle);
        }
        ctx.cluster.execution_list.push(unit);
        Ok(true)
    }

    /// Step 3 of the cascade: a double-width reservation that lets the job
    /// run alone at its best speedup.
    fn allocation_as_spread(
        &self,
        ctx: &mut EngineCtx<'_>,
        wq_idx: usize,
    ) -> Result<bool, SimError> {
        if ctx.cluster.utilization() > self.config().system_utilization {
            return Ok(false);
        }

        let pool = {
            let job = &ctx.cluster.waiting_queue[wq_idx];
            match ctx.cluster.assign_nodes(2 * job.half_node_cores) {
                Some(pool) => pool,
                None => return Ok(false),
            }
        };

        let mut job = ctx.cluster.waiting_queue.remove(wq_idx);
        ctx.start_job(&mut job);
        let half = ctx.cluster.half_node_cores();

        let job_cores = half_node_chunks(&pool, job.half_node_cores, half);
        let idle_cores = &pool - &job_cores;

        job.rescale_speedup(job.max_speedup)?;
        job.assigned_cores = job_cores.clone();
        let parts = ctx.cluster.reserve(&job.signature(), &job_cores);
        for (hostname, _) in &parts {
            job.assigned_hosts.insert(hostname.clone());
        }
        ctx.log_start(&job, &parts);

        let mut unit = ExecUnit::singleton(job);
        if !idle_cores.is_empty() {
            let idle = Job::idle(idle_cores);
            ctx.cluster.reserve(&idle.signature(), &idle.assigned_cores);
            unit.jobs.push(idle);
        }
        ctx.cluster.execution_list.push(unit);
        Ok(true)
    }

    /// The half-socket co-location primitive used by backfilling ranks:
    /// place the job next to at most one resident job per host, provided
    /// every resident pairing passes the admission gate.
    fn colocation(
        &self,
        ctx: &mut EngineCtx<'_>,
        wq_idx: usize,
        socket_conf: &[u32],
    ) -> Result<bool, SimError> {
        let database = ctx.database;
        let heatmap = &database.heatmap;
        let job = &ctx.cluster.waiting_queue[wq_idx];
        let job_name = job.job_name.clone();

        let suitable = ctx
            .cluster
            .find_suitable_nodes(job.num_of_processes, socket_conf);
        if suitable.is_empty() {
            return Ok(false);
        }

        let mut rated: Vec<(f64, (String, Vec<ProcSet>))> = Vec::new();
        for entry in suitable {
            let host = ctx.cluster.host(&entry.0).expect("suitable host exists");
            let residents = resident_names(host);
            if residents.len() > 1 {
                continue;
            }
            let admissible = residents.iter().all(|name| {
                self.pair_admissible_mean(heatmap, &job_name, name)
                    .map_or(false, |mean| mean > self.config().speedup_threshold)
            });
            if !admissible {
                continue;
            }
            rated.push((self.host_alloc_condition(host, job), entry));
        }
        rated.sort_by(|a, b| b.0.total_cmp(&a.0));

        let needed_ppn: u32 = socket_conf.iter().sum();
        let needed_hosts = job.num_of_processes.div_ceil(needed_ppn) as usize;
        if rated.len() < needed_hosts {
            return Ok(false);
        }
        let chosen: Vec<_> = rated
            .into_iter()
            .take(needed_hosts)
            .map(|(_, entry)| entry)
            .collect();

        ctx.deploy_job_to_hosts(&chosen, wq_idx)?;
        Ok(true)
    }

    /// One full deployment pass: reorder, optionally force an aged head
    /// into a compact allocation, then run the cascade over the queue.
    fn deploy_cascade(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        self.reorder_waiting_queue(ctx);
        let mut changed = false;

        if self.config().aging_enabled {
            if let Some(head) = ctx.cluster.waiting_queue.first() {
                if head.age > self.config().age_limit {
                    if self.compact_allocation(ctx, 0)? {
                        ctx.logger.count_deploy(DeployKind::Compact);
                        self.after_deployment(ctx);
                        changed = true;
                    } else {
                        // a starving head blocks the whole pass
                        ctx.logger.count_deploy_failed();
                        if let Some(head) = ctx.cluster.waiting_queue.first_mut() {
                            head.age += 1;
                        }
                        return Ok(changed);
                    }
                }
            }
        }

        // walk a snapshot of ids: placements and pairings shrink the live
        // queue underneath us
        let ids: Vec<i64> = ctx.cluster.waiting_queue.iter().map(|j| j.job_id).collect();
        for job_id in ids {
            let Some(idx) = ctx
                .cluster
                .waiting_queue
                .iter()
                .position(|j| j.job_id == job_id)
            else {
                // consumed as someone else's pairing partner
                continue;
            };

            let placed = if self.colocation_to_xunit(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::ExecColocation);
                true
            } else if self.colocation_with_wjobs(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::WaitColocation);
                true
            } else if self.allocation_as_spread(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::Spread);
                true
            } else if self.compact_allocation(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::Compact);
                true
            } else {
                false
            };

            if placed {
                changed = true;
                self.after_deployment(ctx);
            } else {
                ctx.logger.count_deploy_failed();
            }
        }

        if let Some(head) = ctx.cluster.waiting_queue.first_mut() {
            head.age += 1;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_node_chunks_takes_first_half_of_each_node() {
        // two free 8-core nodes: 0-7 and 8-15
        let pool: ProcSet = "0-15".parse().unwrap();
        assert_eq!(half_node_chunks(&pool, 4, 4), "0-3".parse().unwrap());
        assert_eq!(half_node_chunks(&pool, 8, 4), "0-3 8-11".parse().unwrap());
    }

    #[test]
    fn test_half_node_chunks_consumes_exact_half_intervals() {
        // the second halves of two nodes
        let pool: ProcSet = "4-7 12-15".parse().unwrap();
        assert_eq!(half_node_chunks(&pool, 8, 4), pool);
        assert_eq!(half_node_chunks(&pool, 4, 4), "4-7".parse().unwrap());
    }

    #[test]
    fn test_half_node_chunks_fragmented_fallback() {
        let pool: ProcSet = "0-1 4-5 9".parse().unwrap();
        let out = half_node_chunks(&pool, 4, 4);
        assert_eq!(out.len(), 4);
        assert!(pool.is_superset(&out));
    }
}
