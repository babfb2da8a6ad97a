//! First-in-first-out scheduling with strict head-of-line blocking.

use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::logger::DeployKind;
use crate::scheduler::Scheduler;

pub struct Fifo;

impl Scheduler for Fifo {
    fn name(&self) -> &'static str {
        "FIFO Scheduler"
    }

    /// Walk the waiting queue in submission order and stop at the first job
    /// that does not fit.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::database::{test_heatmap, Database};
    use crate::jobs::Job;
    use crate::logger::Logger;

    fn ctx_parts() -> (Database, Cluster, Logger) {
        let jobs = vec![
            Job::new(0, "A", 8, 10.0, 0.0, 20.0),
            Job::new(1, "B", 4, 1.0, 0.0, 2.0),
        ];
        let database = Database::new(jobs.clone(), test_heatmap(&[]));
        let mut cluster = Cluster::new(2, vec![4]);
        for mut job in jobs {
            job.bind_node_geometry(cluster.cores_per_node());
            cluster.waiting_queue.push(job);
        }
        let mut logger = Logger::new("FIFO Scheduler");
        logger.setup(&database, &cluster);
        (database, cluster, logger)
    }

    #[test]
    fn test_head_of_line_blocks_queue() {
        let (database, mut cluster, mut logger) = ctx_parts();
        let mut ctx = EngineCtx {
            database: &database,
            cluster: &mut cluster,
            logger: &mut logger,
        };

        let mut fifo = Fifo;
        assert!(fifo.deploy(&mut ctx).unwrap());

        // A consumed the whole cluster; B stays queued even though it fits
        // nothing changed for it
        assert_eq!(cluster.execution_list.len(), 1);
        assert_eq!(cluster.waiting_queue.len(), 1);
        assert_eq!(cluster.waiting_queue[0].job_name, "B");
        assert_eq!(cluster.get_idle_cores(), 0);
        assert_eq!(logger.cluster_events.deploying.compact, 1);
        assert_eq!(logger.cluster_events.deploying.failed, 1);
    }

    #[test]
    fn test_deploy_without_waiting_jobs_is_noop() {
        let (database, mut cluster, mut logger) = ctx_parts();
        cluster.waiting_queue.clear();
        let mut ctx = EngineCtx {
            database: &database,
            cluster: &mut cluster,
            logger: &mut logger,
        };
        assert!(!Fifo.deploy(&mut ctx).unwrap());
    }
}
