//! The Ranks family: co-schedulers that reorder the waiting queue by a
//! custom numeric rank before running the placement cascade.

pub mod filler;
pub mod random;

use crate::engine::EngineCtx;
use crate::error::SimError;
use crate::logger::DeployKind;
use crate::scheduler::coscheduler::Coscheduler;

/// Shared backfill of the ranks family: walk the queued jobs behind the
/// head in ascending declared wall time and co-locate them through the
/// half-socket primitive, stopping at the first refusal.
pub(crate) fn backfill_by_walltime<S: Coscheduler>(
    sched: &S,
    ctx: &mut EngineCtx<'_>,
) -> Result<bool, SimError> {
    if ctx.cluster.waiting_queue.len() < 2 {
        return Ok(false);
    }

    let mut candidates: Vec<(i64, f64)> = ctx
        .cluster
        .waiting_queue
        .iter()
        .skip(1)
        .take(sched.config().backfill_depth)
        .map(|j| (j.job_id, j.wall_time))
        .collect();
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

    let half_socket_conf = ctx.cluster.half_socket_allocation();
    let mut changed = false;

    for (job_id, _) in candidates {
        let Some(idx) = ctx
            .cluster
            .waiting_queue
            .iter()
            .position(|j| j.job_id == job_id)
        else {
            continue;
        };
        if sched.colocation(ctx, idx, &half_socket_conf)? {
            ctx.logger.count_deploy(DeployKind::ExecColocation);
            changed = true;
        } else {
            break;
        }
    }
    Ok(changed)
}
