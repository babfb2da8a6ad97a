//! The compute engine drives the discrete-event loop: advance simulated
//! time to the next completion, retire due jobs, invoke the scheduler, and
//! keep co-execution speedups consistent whenever a job's partner set
//! changes.

use procset::ProcSet;

use crate::cluster::xunit::ExecUnit;
use crate::cluster::{ratio_rem_time, Cluster};
use crate::database::Database;
use crate::error::SimError;
use crate::jobs::{Job, JobState};
use crate::logger::{LogEvent, Logger};
use crate::scheduler::Scheduler;

/// Remaining times at or below this are treated as finished.
pub const TIME_EPSILON: f64 = 1e-9;

/// Non-owning handles a scheduler works through during one pass. The engine
/// owns the real state; the scheduler borrows it for the duration of
/// `deploy`/`backfill`.
pub struct EngineCtx<'a> {
    pub database: &'a Database,
    pub cluster: &'a mut Cluster,
    pub logger: &'a mut Logger,
}

impl EngineCtx<'_> {
    /// Move a waiting job into execution: record its start, reserve the
    /// given per-host processor sets, log one start event per host, and
    /// append it to the execution list (as a fresh unit, or merged into the
    /// unit already running on a shared host).
    ///
    /// The caller has already verified the processors are free; this either
    /// fully applies or panics on a bookkeeping bug, never half-applies.
    pub fn deploy_job_to_hosts(
        &mut self,
        host_psets: &[(String, Vec<ProcSet>)],
        wq_idx: usize,
    ) -> Result<(), SimError> {
        let mut job = self.cluster.waiting_queue.remove(wq_idx);
        let sig = job.signature();

        self.start_job(&mut job);

        let mut all_cores = ProcSet::new();
        for (hostname, psets) in host_psets {
            let host_cores = psets.iter().fold(ProcSet::new(), |acc, p| &acc | p);
            job.assigned_hosts.insert(hostname.clone());
            all_cores |= &host_cores;
        }
        job.assigned_cores = all_cores.clone();
        self.cluster.reserve(&sig, &all_cores);

        // resident jobs sharing a host decide whether this is a fresh unit
        // or a co-location merge
        let residents = self.resident_job_ids(&job, host_psets);
        if residents.is_empty() {
            for (hostname, psets) in host_psets {
                self.logger.log(
                    LogEvent::JobStart {
                        job: &job,
                        hostname,
                        psets,
                    },
                    self.cluster,
                );
            }
            self.cluster.execution_list.push(ExecUnit::singleton(job));
            return Ok(());
        }

        self.merge_into_xunit(job, &residents, host_psets)
    }

    /// Stamp the bookkeeping of a job leaving the waiting queue.
    pub fn start_job(&mut self, job: &mut Job) {
        job.start_time = self.cluster.makespan;
        job.waiting_time = self.cluster.makespan - job.submit_time;
        job.state = JobState::Executing;
    }

    /// Log one start event per host slice.
    pub fn log_start(&mut self, job: &Job, parts: &[(String, ProcSet)]) {
        for (hostname, pset) in parts {
            self.logger.log(
                LogEvent::JobStart {
                    job,
                    hostname,
                    psets: std::slice::from_ref(pset),
                },
                self.cluster,
            );
        }
    }

    fn resident_job_ids(&self, job: &Job, host_psets: &[(String, Vec<ProcSet>)]) -> Vec<i64> {
        let mut ids = Vec::new();
        for (hostname, _) in host_psets {
            let Some(host) = self.cluster.host(hostname) else {
                continue;
            };
            for sig in host.jobs.keys() {
                let Some((id, _)) = sig.split_once(':') else {
                    continue;
                };
                let Ok(id) = id.parse::<i64>() else { continue };
                if id >= 0 && id != job.job_id && !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Append `job` as a tail of the unit already running on its hosts and
    /// renormalize every affected speedup.
    fn merge_into_xunit(
        &mut self,
        mut job: Job,
        residents: &[i64],
        host_psets: &[(String, Vec<ProcSet>)],
    ) -> Result<(), SimError> {
        let unit_idx = residents
            .iter()
            .find_map(|&id| self.cluster.xunit_of(id))
            .expect("resident job without an execution unit");

        let database = self.database;
        let heatmap = &database.heatmap;

        // neighbours slowed down below their current speedup get rescaled
        let unit = &mut self.cluster.execution_list[unit_idx];
        let mut worst: Option<(f64, String)> = None;
        for neighbor in unit.real_jobs_mut() {
            if let Some(value) = heatmap.get(&job.job_name, &neighbor.job_name).value() {
                if worst.as_ref().map_or(true, |(w, _)| value < *w) {
                    worst = Some((value, neighbor.job_name.clone()));
                }
            }
            if let Some(value) = heatmap.get(&neighbor.job_name, &job.job_name).value() {
                if value < neighbor.sim_speedup {
                    neighbor.rescale_speedup(value)?;
                }
            }
        }
        if let Some((_, co_name)) = worst {
            ratio_rem_time(heatmap, &mut job, &co_name)?;
        }

        for (hostname, psets) in host_psets {
            self.logger.log(
                LogEvent::JobStart {
                    job: &job,
                    hostname,
                    psets,
                },
                self.cluster,
            );
        }
        self.cluster.execution_list[unit_idx].jobs.push(job);
        Ok(())
    }
}

pub struct ComputeEngine {
    pub database: Database,
    pub cluster: Cluster,
    pub scheduler: Box<dyn Scheduler>,
    pub logger: Logger,
    backfill_enabled: bool,
}

impl ComputeEngine {
    pub fn new(
        database: Database,
        cluster: Cluster,
        scheduler: Box<dyn Scheduler>,
        logger: Logger,
        backfill_enabled: bool,
    ) -> Self {
        Self {
            database,
            cluster,
            scheduler,
            logger,
            backfill_enabled,
        }
    }

    /// Prepare all four subsystems and admit the jobs already due at t=0.
    pub fn setup(&mut self) -> Result<(), SimError> {
        self.cluster.setup();
        self.database.setup();

        let cores_per_node = self.cluster.cores_per_node();
        let capacity = self.cluster.total_cores();
        for job in &mut self.database.preloaded_queue {
            job.bind_node_geometry(cores_per_node);
            if job.num_of_processes > capacity {
                return Err(SimError::ResourceExhausted {
                    job: job.signature(),
                    requested: job.num_of_processes,
                    capacity,
                });
            }
        }
        // deferred submissions are admitted in submit order
        self.database
            .preloaded_queue
            .sort_by(|a, b| a.submit_time.total_cmp(&b.submit_time));

        self.logger.setup(&self.database, &self.cluster);

        let mut ctx = EngineCtx {
            database: &self.database,
            cluster: &mut self.cluster,
            logger: &mut self.logger,
        };
        self.scheduler.setup(&mut ctx)?;

        self.setup_preloaded_jobs();
        Ok(())
    }

    /// Move every preloaded job whose submit time has been reached into the
    /// waiting queue, preserving order.
    pub fn setup_preloaded_jobs(&mut self) {
        let makespan = self.cluster.makespan;
        while let Some(job) = self.database.preloaded_queue.first() {
            if job.submit_time <= makespan + TIME_EPSILON {
                self.cluster
                    .waiting_queue
                    .push(self.database.preloaded_queue.remove(0));
            } else {
                break;
            }
        }
    }

    fn next_submit_time(&self) -> Option<f64> {
        self.database.preloaded_queue.first().map(|j| j.submit_time)
    }

    /// All queues drained: the simulation is over.
    pub fn done(&self) -> bool {
        self.database.preloaded_queue.is_empty()
            && self.cluster.waiting_queue.is_empty()
            && self.cluster.execution_list.is_empty()
    }

    /// One atomic simulation tick.
    pub fn sim_step(&mut self) -> Result<(), SimError> {
        self.setup_preloaded_jobs();

        let mut ctx = EngineCtx {
            database: &self.database,
            cluster: &mut self.cluster,
            logger: &mut self.logger,
        };
        let deployed = self.scheduler.deploy(&mut ctx)?;
        if self.backfill_enabled {
            self.scheduler.backfill(&mut ctx)?;
        }
        log::trace!(
            "t={} deploy changed execution list: {deployed}",
            self.cluster.makespan
        );

        if self.cluster.execution_list.is_empty() {
            if let Some(head) = self.cluster.waiting_queue.first() {
                return Err(SimError::Deadlock {
                    job: head.signature(),
                    requested: head.num_of_processes,
                    idle: self.cluster.get_idle_cores(),
                });
            }
            if let Some(next) = self.next_submit_time() {
                // nothing running and nothing waiting: jump to the next
                // submission
                self.cluster.makespan = next;
            }
            return Ok(());
        }

        // closed-form next event: the earliest completion, capped by the
        // next pending submission
        let mut quantum = f64::INFINITY;
        for unit in &self.cluster.execution_list {
            for job in unit.real_jobs() {
                quantum = quantum.min(job.remaining_time.max(0.0));
            }
        }
        if let Some(next) = self.next_submit_time() {
            let until_submit = next - self.cluster.makespan;
            if until_submit > TIME_EPSILON {
                quantum = quantum.min(until_submit);
            }
        }

        for unit in &mut self.cluster.execution_list {
            for job in unit.real_jobs_mut() {
                job.remaining_time = (job.remaining_time - quantum).max(0.0);
            }
        }
        self.cluster.makespan += quantum;

        self.finish_due_jobs()?;
        Ok(())
    }

    /// Run to natural completion.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.setup()?;
        while !self.done() {
            self.sim_step()?;
        }
        log::debug!(
            "{}: finished with makespan {}",
            self.logger.scheduler_name,
            self.cluster.makespan
        );
        Ok(())
    }

    /// Retire every job whose remaining time reached zero, return its
    /// processors, and renormalize the survivors it was paired with.
    fn finish_due_jobs(&mut self) -> Result<(), SimError> {
        // ascending job id keeps same-tick finish order deterministic
        let mut due: Vec<(usize, i64)> = Vec::new();
        for (unit_idx, unit) in self.cluster.execution_list.iter().enumerate() {
            for job in unit.real_jobs() {
                if job.remaining_time <= TIME_EPSILON {
                    due.push((unit_idx, job.job_id));
                }
            }
        }
        due.sort_by_key(|&(_, id)| id);

        let mut touched_units: Vec<usize> = Vec::new();
        for &(unit_idx, job_id) in &due {
            let unit = &mut self.cluster.execution_list[unit_idx];
            let pos = unit
                .jobs
                .iter()
                .position(|j| j.job_id == job_id)
                .expect("due job vanished from its unit");
            let mut job = unit.jobs.remove(pos);

            job.finish_time = self.cluster.makespan;
            job.state = JobState::Finished;
            let sig = job.signature();
            self.cluster.release(&sig, &job.assigned_cores);
            self.logger
                .log(LogEvent::JobFinish { job: &job }, &self.cluster);

            if !touched_units.contains(&unit_idx) {
                touched_units.push(unit_idx);
            }
        }

        self.renormalize_units(&touched_units)?;

        // units reduced to their idle tail (or nothing) dissolve and give
        // the reservation back
        let mut idx = 0;
        while idx < self.cluster.execution_list.len() {
            let unit = &mut self.cluster.execution_list[idx];
            if unit.real_jobs().next().is_none() {
                if let Some(idle) = unit.take_idle_tail() {
                    self.cluster.release(&idle.signature(), &idle.assigned_cores);
                }
                self.cluster.execution_list.remove(idx);
            } else {
                idx += 1;
            }
        }
        Ok(())
    }

    /// A job that lost a co-tenant runs against its new worst remaining
    /// partner, at its best solo speedup when alone on a reservation, or at
    /// the compact baseline when exclusive.
    fn renormalize_units(&mut self, unit_idxs: &[usize]) -> Result<(), SimError> {
        for &unit_idx in unit_idxs {
            let unit = &mut self.cluster.execution_list[unit_idx];
            let members: Vec<(i64, String)> = unit
                .real_jobs()
                .map(|j| (j.job_id, j.job_name.clone()))
                .collect();
            let has_idle = !unit.is_filled();

            for job in unit.real_jobs_mut() {
                let partners: Vec<&String> = members
                    .iter()
                    .filter(|(id, _)| *id != job.job_id)
                    .map(|(_, n)| n)
                    .collect();

                if partners.is_empty() {
                    let target = if has_idle { job.max_speedup } else { 1.0 };
                    if job.sim_speedup != target {
                        job.rescale_speedup(target)?;
                    }
                    continue;
                }

                let worst = partners
                    .iter()
                    .filter_map(|p| {
                        self.database
                            .heatmap
                            .get(&job.job_name, p)
                            .value()
                            .map(|v| (v, *p))
                    })
                    .min_by(|a, b| a.0.total_cmp(&b.0));
                if let Some((value, _)) = worst {
                    if job.sim_speedup != value {
                        job.rescale_speedup(value)?;
                    }
                }
            }
        }
        Ok(())
    }
}
