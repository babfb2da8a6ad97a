//! Conservative backfilling: every waiting job holds a projected start time
//! computed by virtually placing the whole queue onto the future timeline,
//! and a backfill candidate may only start if it delays none of them.

use std::collections::BTreeMap;

use crate::cluster::Cluster;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::logger::DeployKind;
use crate::scheduler::Scheduler;

const PROJECTION_EPSILON: f64 = 1e-9;

/// A step function of free processors over future time, used as a planning
/// board. Reservations subtract whole core counts; processor identities are
/// irrelevant at this altitude.
#[derive(Debug, Clone)]
pub(crate) struct Profile {
    // (time, free cores from that time on), strictly increasing times
    points: Vec<(f64, i64)>,
}

impl Profile {
    /// Build the release profile of the currently executing jobs.
    pub fn from_cluster(cluster: &Cluster) -> Self {
        let mut events: Vec<(f64, i64)> = Vec::new();
        for unit in &cluster.execution_list {
            for job in unit.real_jobs() {
                events.push((
                    cluster.makespan + job.remaining_time,
                    i64::from(job.assigned_cores.len()),
                ));
            }
            // the unit's idle reservation returns when its last member does
            if let Some(idle) = unit.idle_tail() {
                let last = unit
                    .real_jobs()
                    .map(|j| cluster.makespan + j.remaining_time)
                    .fold(cluster.makespan, f64::max);
                events.push((last, i64::from(idle.assigned_cores.len())));
            }
        }
        events.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut points = vec![(cluster.makespan, i64::from(cluster.get_idle_cores()))];
        for (at, cores) in events {
            let free = points.last().unwrap().1 + cores;
            if (points.last().unwrap().0 - at).abs() <= PROJECTION_EPSILON {
                points.last_mut().unwrap().1 = free;
            } else {
                points.push((at, free));
            }
        }
        Self { points }
    }

    fn free_at(&self, idx: usize) -> i64 {
        self.points[idx].1
    }

    /// Earliest time at or after `self.points[0].0` where `req` cores stay
    /// free for `duration`.
    pub fn earliest_fit(&self, req: u32, duration: f64) -> f64 {
        let req = i64::from(req);
        'starts: for i in 0..self.points.len() {
            let start = self.points[i].0;
            let end = start + duration;
            for j in i..self.points.len() {
                if self.points[j].0 >= end - PROJECTION_EPSILON {
                    break;
                }
                if self.free_at(j) < req {
                    continue 'starts;
                }
            }
            return start;
        }
        // past the last breakpoint everything has been released
        self.points.last().unwrap().0
    }

    /// Subtract `req` cores over `[start, start + duration)`.
    pub fn reserve(&mut self, start: f64, duration: f64, req: u32) {
        let req = i64::from(req);
        let end = start + duration;

        for &at in &[start, end] {
            match self
                .points
                .iter()
                .position(|&(t, _)| (t - at).abs() <= PROJECTION_EPSILON)
            {
                Some(_) => {}
                None => {
                    let idx = self.points.partition_point(|&(t, _)| t < at);
                    let free = if idx == 0 { self.points[0].1 } else { self.points[idx - 1].1 };
                    self.points.insert(idx, (at, free));
                }
            }
        }

        for point in &mut self.points {
            if point.0 >= start - PROJECTION_EPSILON && point.0 < end - PROJECTION_EPSILON {
                point.1 -= req;
            }
        }
    }
}

pub struct Conservative {
    pub backfill_depth: usize,
    /// Current projected start per waiting job id.
    projections: BTreeMap<i64, f64>,
    /// The first projection each job ever received; starts never exceed it.
    first_projection: BTreeMap<i64, f64>,
}

impl Default for Conservative {
    fn default() -> Self {
        Self {
            backfill_depth: 100,
            projections: BTreeMap::new(),
            first_projection: BTreeMap::new(),
        }
    }
}

impl Conservative {
    /// Virtually place every waiting job, in queue order, onto the release
    /// profile.
    fn project_queue(profile: &mut Profile, queue: &[(i64, u32, f64)]) -> BTreeMap<i64, f64> {
        let mut projected = BTreeMap::new();
        for &(job_id, req, wall) in queue {
            let start = profile.earliest_fit(req, wall);
            profile.reserve(start, wall, req);
            projected.insert(job_id, start);
        }
        projected
    }

    fn queue_outline(cluster: &Cluster) -> Vec<(i64, u32, f64)> {
        cluster
            .waiting_queue
            .iter()
            .map(|j| (j.job_id, j.num_of_processes, j.wall_time))
            .collect()
    }

    fn recompute_projections(&mut self, cluster: &Cluster) {
        let mut profile = Profile::from_cluster(cluster);
        self.projections = Self::project_queue(&mut profile, &Self::queue_outline(cluster));
        for (&job_id, &start) in &self.projections {
            self.first_projection.entry(job_id).or_insert(start);
        }
    }

    /// The projected start a job held when it was first planned, if any.
    pub fn first_projection_of(&self, job_id: i64) -> Option<f64> {
        self.first_projection.get(&job_id).copied()
    }
}

impl Scheduler for Conservative {
    fn name(&self) -> &'static str {
        "Conservative Scheduler"
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
        self.recompute_projections(ctx.cluster);
        Ok(changed)
    }

    /// A candidate may start now only when doing so delays no projected
    /// start of the jobs queued ahead of or behind it.
    fn backfill(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        if ctx.cluster.waiting_queue.len() < 2 {
            return Ok(false);
        }

        let mut changed = false;
        let mut idx = 1;
        let mut scanned = 0;
        while idx < ctx.cluster.waiting_queue.len() && scanned < self.backfill_depth {
            scanned += 1;

            let candidate = &ctx.cluster.waiting_queue[idx];
            let (cand_id, cand_req, cand_wall) =
                (candidate.job_id, candidate.num_of_processes, candidate.wall_time);

            // would starting the candidate now fit at all?
            let mut profile = Profile::from_cluster(ctx.cluster);
            if profile.earliest_fit(cand_req, cand_wall) > ctx.cluster.makespan + PROJECTION_EPSILON
            {
                idx += 1;
                continue;
            }
            profile.reserve(ctx.cluster.makespan, cand_wall, cand_req);

            // replan everyone else around it and compare with their current
            // projections
            let others: Vec<_> = Self::queue_outline(ctx.cluster)
                .into_iter()
                .filter(|&(id, _, _)| id != cand_id)
                .collect();
            let replanned = Self::project_queue(&mut profile, &others);
            let delays_someone = replanned.iter().any(|(id, &start)| {
                self.projections
                    .get(id)
                    .is_some_and(|&old| start > old + PROJECTION_EPSILON)
            });

            if !delays_someone && self.compact_allocation(ctx, idx)? {
                ctx.logger.count_deploy(DeployKind::Compact);
                changed = true;
                self.recompute_projections(ctx.cluster);
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
            Box::new(Conservative::default()),
            Logger::new("Conservative Scheduler"),
            true,
        );
        eng.run().unwrap();
        eng
    }

    #[test]
    fn test_profile_fit_and_reserve() {
        let mut cluster = Cluster::new(2, vec![4]);
        let mut a = Job::new(0, "A", 8, 10.0, 0.0, 20.0);
        a.assigned_cores = "0-7".parse().unwrap();
        cluster.reserve("0:A", &a.assigned_cores);
        cluster
            .execution_list
            .push(crate::cluster::xunit::ExecUnit::singleton(a));

        let mut profile = Profile::from_cluster(&cluster);
        // nothing free until A releases at t=10
        assert_eq!(profile.earliest_fit(4, 5.0), 10.0);
        assert_eq!(profile.earliest_fit(0, 1.0), 0.0);

        profile.reserve(10.0, 5.0, 8);
        assert_eq!(profile.earliest_fit(4, 1.0), 15.0);
    }

    #[test]
    fn test_backfill_that_cannot_delay_projections() {
        // 2 nodes x (4,): A fills the machine for 10s. Head H wants the
        // whole machine next. B (4 cores, wall 3) cannot start before t=10
        // anyway; C-like small jobs are only admitted into gaps that leave
        // H's projection at t=10 intact.
        let eng = run(
            2,
            vec![
                Job::new(0, "A", 8, 10.0, 0.0, 10.0),
                Job::new(1, "H", 8, 5.0, 0.0, 5.0),
                Job::new(2, "B", 4, 3.0, 0.0, 3.0),
            ],
        );
        // B may not backfill at t=0 (no free cores) and may not start at
        // t=10 ahead of H's projection, so it runs after H
        assert_eq!(eng.logger.job_events["1:H"].start_time, 10.0);
        assert_eq!(eng.logger.job_events["2:B"].start_time, 15.0);
    }

    #[test]
    fn test_backfill_into_genuinely_free_gap() {
        // 2 nodes x (4,): A holds one node for 10s, H wants both nodes
        // (projected t=10), B (one node, wall 2) fits the other node now
        // without touching H's projection
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
    }

    #[test]
    fn test_starts_never_exceed_first_projection() {
        // run the projection bookkeeping directly on a small queue
        let mut cluster = Cluster::new(2, vec![4]);
        for (id, name, procs, time) in
            [(0, "A", 8, 10.0), (1, "B", 8, 5.0), (2, "C", 4, 3.0)]
        {
            let mut job = Job::new(id, name, procs, time, 0.0, time);
            job.bind_node_geometry(cluster.cores_per_node());
            cluster.waiting_queue.push(job);
        }

        let mut sched = Conservative::default();
        sched.recompute_projections(&cluster);

        // A starts immediately, B after A, C after B's full-machine window
        assert_eq!(sched.first_projection_of(0), Some(0.0));
        assert_eq!(sched.first_projection_of(1), Some(10.0));
        assert_eq!(sched.first_projection_of(2), Some(15.0));
    }
}
