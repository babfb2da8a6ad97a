//! Random ranks: the pragmatic member of the family. Ranks the queue by
//! requested processors, prefers idle hosts for co-location, and backfills
//! through the half-socket primitive.

use crate::cluster::host::Host;
use crate::cluster::xunit::ExecUnit;
use crate::cluster::Cluster;
use crate::database::Heatmap;
use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::jobs::Job;
use crate::scheduler::coscheduler::{Coscheduler, CoschedulerConfig};
use crate::scheduler::ranks::backfill_by_walltime;
use crate::scheduler::Scheduler;

#[derive(Default)]
pub struct RandomRanks {
    pub config: CoschedulerConfig,
}

impl Scheduler for RandomRanks {
    fn name(&self) -> &'static str {
        "Random Ranks Co-Scheduler"
    }

    fn deploy(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        self.deploy_cascade(ctx)
    }

    fn backfill(&mut self, ctx: &mut EngineCtx<'_>) -> Result<bool, SimError> {
        backfill_by_walltime(self, ctx)
    }

    /// Big jobs first.
    fn waiting_queue_reorder(&self, _cluster: &Cluster, job: &Job) -> f64 {
        f64::from(job.num_of_processes)
    }

    /// Idle hosts before occupied ones.
    fn host_alloc_condition(&self, host: &Host, _job: &Job) -> f64 {
        if host.is_idle() {
            1.0
        } else {
            0.0
        }
    }
}

impl Coscheduler for RandomRanks {
    fn config(&self) -> &CoschedulerConfig {
        &self.config
    }

    /// The promised pair speedup is the whole rank.
    fn waiting_job_candidates_reorder(
        &self,
        heatmap: &Heatmap,
        _cluster: &Cluster,
        job: &Job,
        co_job: &Job,
    ) -> f64 {
        self.pair_admissible_mean(heatmap, &job.job_name, &co_job.job_name)
            .unwrap_or(0.0)
    }

    fn xunit_candidates_reorder(
        &self,
        heatmap: &Heatmap,
        _cluster: &Cluster,
        job: &Job,
        xunit: &ExecUnit,
    ) -> f64 {
        self.pair_admissible_mean(heatmap, &job.job_name, &xunit.head().job_name)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{test_heatmap, Database};
    use crate::engine::ComputeEngine;
    use crate::logger::Logger;

    fn cosim(
        nodes: u32,
        socket_conf: Vec<u32>,
        jobs: Vec<Job>,
        entries: &[(&str, &str, Option<f64>)],
        threshold: f64,
    ) -> ComputeEngine {
        let mut sched = RandomRanks::default();
        sched.config.speedup_threshold = threshold;
        ComputeEngine::new(
            Database::new(jobs, test_heatmap(entries)),
            Cluster::new(nodes, socket_conf),
            Box::new(sched),
            Logger::new("Random Ranks Co-Scheduler"),
            false,
        )
    }

    #[test]
    fn test_colocation_accepted_above_threshold() {
        // 1 node x (4,4); the pairing promises a 0.85 mean, above the 0.8
        // threshold, so A and B share the node's half slices
        let mut eng = cosim(
            1,
            vec![4, 4],
            vec![
                Job::new(0, "A", 4, 10.0, 0.0, 40.0),
                Job::new(1, "B", 4, 10.0, 0.0, 40.0),
            ],
            &[
                ("A", "A", Some(1.0)),
                ("A", "B", Some(0.8)),
                ("B", "B", Some(1.0)),
                ("B", "A", Some(0.9)),
            ],
            0.8,
        );
        eng.run().unwrap();

        let a = &eng.logger.job_events["0:A"];
        let b = &eng.logger.job_events["1:B"];
        assert_eq!(a.start_time, 0.0);
        assert_eq!(b.start_time, 0.0);
        assert_eq!(a.assigned_procs.len(), 4);
        assert_eq!(b.assigned_procs.len(), 4);

        // A slows to 0.8, B to 0.9; B finishes at 100/9 s, after which A
        // runs exclusively again at the 1.0 baseline and ends at 110/9 s
        assert!((b.finish_time - 100.0 / 9.0).abs() < 1e-9);
        assert!((a.finish_time - 110.0 / 9.0).abs() < 1e-9);
        assert!((eng.cluster.makespan - 110.0 / 9.0).abs() < 1e-9);
        assert_eq!(eng.logger.cluster_events.deploying.wait_colocation, 1);
    }

    #[test]
    fn test_colocation_rejected_below_threshold() {
        // the mean of 0.7 misses the 0.8 bar: no sharing; B waits out A's
        // solo run on the machine
        let mut eng = cosim(
            1,
            vec![4, 4],
            vec![
                Job::new(0, "A", 4, 10.0, 0.0, 40.0),
                Job::new(1, "B", 4, 10.0, 0.0, 40.0),
            ],
            &[
                ("A", "A", Some(1.0)),
                ("A", "B", Some(0.7)),
                ("B", "B", Some(1.0)),
                ("B", "A", Some(0.7)),
            ],
            0.8,
        );
        eng.run().unwrap();

        assert_eq!(eng.logger.job_events["0:A"].start_time, 0.0);
        assert_eq!(eng.logger.job_events["1:B"].start_time, 10.0);
        assert_eq!(eng.cluster.makespan, 20.0);
        assert_eq!(eng.logger.cluster_events.deploying.wait_colocation, 0);
    }

    #[test]
    fn test_unknown_pairing_is_skipped() {
        // A-B is null in the heatmap: ineligible for co-location, never an
        // error
        let mut eng = cosim(
            1,
            vec![4, 4],
            vec![
                Job::new(0, "A", 4, 10.0, 0.0, 40.0),
                Job::new(1, "B", 4, 10.0, 0.0, 40.0),
            ],
            &[
                ("A", "A", Some(1.0)),
                ("A", "B", None),
                ("B", "B", Some(1.0)),
                ("B", "A", Some(0.9)),
            ],
            0.8,
        );
        eng.run().unwrap();
        assert_eq!(eng.cluster.makespan, 20.0);
    }

    #[test]
    fn test_spread_runs_at_max_speedup() {
        // one lonely job, plenty of room: it spreads over a double
        // reservation and runs at its best solo speedup of 1.25
        let mut eng = cosim(
            2,
            vec![4],
            vec![Job::new(0, "A", 4, 10.0, 0.0, 40.0)],
            &[("A", "A", Some(1.25))],
            0.8,
        );
        eng.run().unwrap();

        assert!((eng.cluster.makespan - 8.0).abs() < 1e-9);
        let a = &eng.logger.job_events["0:A"];
        assert_eq!(a.assigned_procs.len(), 4);
        assert_eq!(eng.logger.cluster_events.deploying.spread, 1);
    }

    #[test]
    fn test_tail_joins_spread_unit() {
        // A spreads over both nodes first; B then takes over the idle half
        // and both renormalize to the pairwise values
        let mut eng = cosim(
            2,
            vec![4],
            vec![
                Job::new(0, "A", 4, 10.0, 0.0, 40.0),
                Job::new(1, "B", 4, 10.0, 0.0, 40.0),
            ],
            &[
                ("A", "A", Some(1.25)),
                ("A", "B", Some(0.8)),
                ("B", "B", Some(1.0)),
                ("B", "A", Some(0.9)),
            ],
            0.8,
        );
        eng.run().unwrap();

        let a = &eng.logger.job_events["0:A"];
        let b = &eng.logger.job_events["1:B"];
        assert_eq!(a.start_time, 0.0);
        assert_eq!(b.start_time, 0.0);
        // A was re-scaled from its spread speedup of 1.25 down to the
        // pairwise 0.8; when B (running against A at 0.9) finishes at
        // 100/9 s, A reverts to the exclusive baseline and ends at 110/9 s
        assert!((b.finish_time - 100.0 / 9.0).abs() < 1e-9);
        assert!((a.finish_time - 110.0 / 9.0).abs() < 1e-9);
        assert_eq!(eng.logger.cluster_events.deploying.exec_colocation, 1);
    }

    #[test]
    fn test_aged_head_blocks_the_pass() {
        // X occupies two of three nodes until t=20. Big (12 cores) arrives
        // at t=1 and only ever fits on the whole machine; Tiny arrives at
        // t=3 when Big has already aged past the limit. An aged head
        // refuses to be bypassed, so Tiny stays queued until Big has run.
        let entries = &[
            ("X", "X", Some(1.0)),
            ("Big", "Big", Some(1.0)),
            ("Tiny", "Tiny", Some(1.0)),
        ];
        let jobs = || {
            let mut big = Job::new(1, "Big", 12, 5.0, 0.0, 10.0);
            big.submit_time = 1.0;
            let mut tiny = Job::new(2, "Tiny", 4, 1.0, 0.0, 2.0);
            tiny.submit_time = 3.0;
            vec![Job::new(0, "X", 8, 20.0, 0.0, 40.0), big, tiny]
        };

        let run = |aging: bool| {
            let mut sched = RandomRanks::default();
            sched.config.speedup_threshold = 2.0; // nothing co-locates
            sched.config.system_utilization = 0.0; // nothing spreads
            sched.config.aging_enabled = aging;
            sched.config.age_limit = 0;
            let mut eng = ComputeEngine::new(
                Database::new(jobs(), test_heatmap(entries)),
                Cluster::new(3, vec![4]),
                Box::new(sched),
                Logger::new("Random Ranks Co-Scheduler"),
                false,
            );
            eng.run().unwrap();
            eng
        };

        let aged = run(true);
        assert_eq!(aged.logger.job_events["1:Big"].start_time, 20.0);
        assert_eq!(aged.logger.job_events["2:Tiny"].start_time, 25.0);

        // without aging, Tiny slips past the starving head onto the free
        // node as soon as it arrives
        let unaged = run(false);
        assert_eq!(unaged.logger.job_events["2:Tiny"].start_time, 3.0);
    }
}
