//! The event sink of a simulation instance. Records per-job timestamps and
//! cluster-wide occupancy as jobs start and finish, and derives the Gantt
//! figure and Standard Workload Format trace afterwards.

use procset::ProcSet;
use serde_json::json;
use std::collections::BTreeMap;

use crate::cluster::Cluster;
use crate::database::Database;
use crate::jobs::Job;

/// Events the compute engine and schedulers report.
#[derive(Debug)]
pub enum LogEvent<'a> {
    JobStart {
        job: &'a Job,
        hostname: &'a str,
        psets: &'a [ProcSet],
    },
    JobFinish {
        job: &'a Job,
    },
}

/// Which placement strategy a deployment went through.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeployKind {
    Spread,
    Compact,
    ExecColocation,
    WaitColocation,
}

#[derive(Debug, Clone, Default)]
pub struct DeployCounters {
    pub spread: u64,
    pub compact: u64,
    pub exec_colocation: u64,
    pub wait_colocation: u64,
    pub success: u64,
    pub failed: u64,
}

/// Everything recorded about one job over the run.
#[derive(Debug, Clone, Default)]
pub struct JobEvents {
    pub submit_time: f64,
    pub start_time: f64,
    pub finish_time: f64,
    pub waiting_time: f64,
    pub wall_time: f64,
    pub num_of_processes: u32,
    pub assigned_procs: ProcSet,
    pub hosts: Vec<String>,
    pub speedups: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterEvents {
    /// Simulated times at which occupancy changed.
    pub checkpoints: Vec<f64>,
    /// Free processors after each checkpoint; parallel to `checkpoints`.
    pub unused_cores: Vec<u32>,
    /// Cumulative finished jobs after each checkpoint; parallel to
    /// `checkpoints`.
    pub finished_jobs: Vec<u32>,
    pub deploying: DeployCounters,
}

/// Per-job utilization of a run relative to a reference run.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct JobUtilization {
    /// Reference run time over this run time.
    pub speedup: f64,
    /// Reference turnaround over this turnaround.
    pub turnaround: f64,
    /// Reference waiting time minus this waiting time.
    pub waiting: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Logger {
    pub scheduler_name: String,
    pub cluster_events: ClusterEvents,
    pub job_events: BTreeMap<String, JobEvents>,
    total_cores: u32,
    last_makespan: f64,
}

impl Logger {
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            ..Default::default()
        }
    }

    /// Prime the per-job records and the occupancy trace.
    pub fn setup(&mut self, database: &Database, cluster: &Cluster) {
        self.total_cores = cluster.total_cores();
        self.last_makespan = 0.0;

        self.cluster_events = ClusterEvents {
            checkpoints: vec![0.0],
            unused_cores: vec![self.total_cores],
            finished_jobs: vec![0],
            deploying: DeployCounters::default(),
        };

        self.job_events.clear();
        for job in &database.preloaded_queue {
            self.job_events.insert(
                job.signature(),
                JobEvents {
                    wall_time: job.wall_time,
                    num_of_processes: job.num_of_processes,
                    ..Default::default()
                },
            );
        }
    }

    pub fn log(&mut self, event: LogEvent<'_>, cluster: &Cluster) {
        match event {
            LogEvent::JobStart { job, hostname, psets } => {
                let pset = psets.iter().fold(ProcSet::new(), |acc, p| &acc | p);
                let events = self.job_events.entry(job.signature()).or_default();
                events.submit_time = job.submit_time;
                events.start_time = job.start_time;
                events.waiting_time = job.waiting_time;
                events.assigned_procs |= &pset;
                events.speedups.push(job.sim_speedup);
                if !events.hosts.iter().any(|h| h == hostname) {
                    events.hosts.push(hostname.to_string());
                }
                self.checkpoint(cluster, false);
            }
            LogEvent::JobFinish { job } => {
                let events = self.job_events.entry(job.signature()).or_default();
                events.finish_time = job.finish_time;
                self.checkpoint(cluster, true);
            }
        }
    }

    pub fn count_deploy(&mut self, kind: DeployKind) {
        let counters = &mut self.cluster_events.deploying;
        match kind {
            DeployKind::Spread => counters.spread += 1,
            DeployKind::Compact => counters.compact += 1,
            DeployKind::ExecColocation => counters.exec_colocation += 1,
            DeployKind::WaitColocation => counters.wait_colocation += 1,
        }
        counters.success += 1;
    }

    pub fn count_deploy_failed(&mut self) {
        self.cluster_events.deploying.failed += 1;
    }

    fn checkpoint(&mut self, cluster: &Cluster, finished: bool) {
        let events = &mut self.cluster_events;
        self.last_makespan = cluster.makespan;

        if *events.checkpoints.last().unwrap() != cluster.makespan {
            events.checkpoints.push(cluster.makespan);
            events.unused_cores.push(cluster.get_idle_cores());
            events
                .finished_jobs
                .push(*events.finished_jobs.last().unwrap());
        } else {
            *events.unused_cores.last_mut().unwrap() = cluster.get_idle_cores();
        }
        if finished {
            *events.finished_jobs.last_mut().unwrap() += 1;
        }
    }

    /// A JSON figure specification: one filled rectangle per job per
    /// processor interval on the (time, processor) plane.
    pub fn get_gantt_representation(&self) -> serde_json::Value {
        let num_of_jobs = self.job_events.len().max(1);
        let mut data = Vec::new();

        for (idx, (sig, events)) in self.job_events.iter().enumerate() {
            // evenly spaced hues make neighbouring jobs distinguishable
            let hue = 360.0 * idx as f64 / num_of_jobs as f64;
            let fillcolor = format!("hsl({hue:.0},70%,50%)");

            for interval in events.assigned_procs.intervals() {
                let (x_min, x_max) = (events.start_time, events.finish_time);
                let (y_min, y_max) = (f64::from(interval.lo), f64::from(interval.hi) + 1.0);

                data.push(json!({
                    "type": "scatter",
                    "mode": "lines",
                    "x": [x_min, x_max, x_max, x_min, x_min],
                    "y": [y_min, y_min, y_max, y_max, y_min],
                    "fill": "toself",
                    "fillcolor": fillcolor,
                    "line": { "width": 0.1, "color": "black" },
                    "legendgroup": sig,
                    "showlegend": false,
                    "name": format!(
                        "{sig}<br>submit time = {:.2} s<br>start time = {:.2} s<br>\
                         finish time = {:.2} s<br>waiting time = {:.2} s<br>\
                         hosts = {}<br>processors = {}",
                        events.submit_time,
                        events.start_time,
                        events.finish_time,
                        events.waiting_time,
                        events.hosts.len(),
                        events.assigned_procs.len(),
                    ),
                }));
            }
        }

        json!({
            "data": data,
            "layout": {
                "title": format!("{}<br>Gantt Plot", self.scheduler_name),
                "xaxis": { "title": "Time", "range": [0.0, self.last_makespan] },
                "yaxis": { "title": "Cores", "range": [0, self.total_cores] },
            },
        })
    }

    /// Standard Workload Format rows with columns 1-5 and 8-9 populated and
    /// the executable number carrying the job name.
    pub fn get_workload(&self) -> String {
        let mut out = String::from(
            "Job Number,\
             Submit Time,Wait Time,Run Time,\
             Number of Allocated Processors,Average CPU Time Used,Used Memory,\
             Requested Number of Processors,Requested Time,Requested Memory,\
             Status,User ID,Group ID,Executable Number,\
             Queue Number,Partition Number,Preceding Job Number,Think Time from Preceding Job\n",
        );

        for (sig, events) in &self.job_events {
            let (job_id, job_name) = sig.split_once(':').unwrap_or((sig, ""));
            out.push_str(&format!(
                "{job_id},{},{},{},{},,,{},{},,1,,,{job_name},,,,\n",
                events.submit_time,
                events.waiting_time,
                events.finish_time - events.start_time,
                events.assigned_procs.len(),
                events.num_of_processes,
                events.wall_time,
            ));
        }

        out
    }

    /// Per-job utilization relative to a reference run (commonly the
    /// default scheduler on the same workload).
    pub fn get_jobs_utilization(&self, reference: &Logger) -> BTreeMap<String, JobUtilization> {
        let mut points = BTreeMap::new();

        for (sig, events) in &self.job_events {
            let Some(base) = reference.job_events.get(sig) else {
                continue;
            };
            points.insert(
                sig.clone(),
                JobUtilization {
                    speedup: (base.finish_time - base.start_time)
                        / (events.finish_time - events.start_time),
                    turnaround: (base.finish_time - base.submit_time)
                        / (events.finish_time - events.submit_time),
                    waiting: base.waiting_time - events.waiting_time,
                },
            );
        }

        points
    }

    /// Step function of free processors over time. The tail is pinned back
    /// to the full machine since the last finish frees everything.
    pub fn get_unused_cores_graph(&self) -> (Vec<f64>, Vec<u32>) {
        let mut unused = self.cluster_events.unused_cores.clone();
        unused.push(self.total_cores);
        (self.cluster_events.checkpoints.clone(), unused)
    }

    /// Step function of cumulative finished jobs over time.
    pub fn get_jobs_throughput(&self) -> (Vec<f64>, Vec<u32>) {
        (
            self.cluster_events.checkpoints.clone(),
            self.cluster_events.finished_jobs.clone(),
        )
    }

    /// Step function of waiting-queue length over time.
    pub fn get_waiting_queue_graph(&self) -> (Vec<f64>, Vec<u32>) {
        let mut lengths = Vec::with_capacity(self.cluster_events.checkpoints.len());
        for &check in &self.cluster_events.checkpoints {
            let waiting = self
                .job_events
                .values()
                .filter(|e| e.submit_time <= check && e.start_time > check)
                .count();
            lengths.push(waiting as u32);
        }
        (self.cluster_events.checkpoints.clone(), lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_heatmap;

    fn logged_run() -> Logger {
        let mut cluster = Cluster::new(1, vec![4]);
        let mut job = Job::new(0, "j0", 4, 10.0, 0.0, 20.0);
        let database = Database::new(vec![job.clone()], test_heatmap(&[("j0", "j0", Some(1.0))]));

        let mut logger = Logger::new("FIFO Scheduler");
        logger.setup(&database, &cluster);

        let cores: ProcSet = "0-3".parse().unwrap();
        cluster.reserve(&job.signature(), &cores);
        job.assigned_cores = cores.clone();
        job.start_time = 0.0;
        logger.log(
            LogEvent::JobStart {
                job: &job,
                hostname: "host0",
                psets: &[cores.clone()],
            },
            &cluster,
        );

        cluster.makespan = 10.0;
        cluster.release(&job.signature(), &cores);
        job.finish_time = 10.0;
        logger.log(LogEvent::JobFinish { job: &job }, &cluster);

        logger
    }

    #[test]
    fn test_checkpoints_track_occupancy() {
        let logger = logged_run();
        assert_eq!(logger.cluster_events.checkpoints, vec![0.0, 10.0]);
        assert_eq!(logger.cluster_events.unused_cores, vec![0, 4]);
        assert_eq!(logger.cluster_events.finished_jobs, vec![0, 1]);
    }

    #[test]
    fn test_job_events_capture_trace() {
        let logger = logged_run();
        let events = &logger.job_events["0:j0"];
        assert_eq!(events.start_time, 0.0);
        assert_eq!(events.finish_time, 10.0);
        assert_eq!(events.assigned_procs, "0-3".parse().unwrap());
        assert_eq!(events.hosts, vec!["host0".to_string()]);
    }

    #[test]
    fn test_workload_format() {
        let logger = logged_run();
        let workload = logger.get_workload();
        let mut lines = workload.lines();

        let header = lines.next().unwrap();
        assert!(header.starts_with("Job Number,Submit Time,Wait Time,Run Time,"));
        assert_eq!(header.split(',').count(), 18);

        let row = lines.next().unwrap();
        assert_eq!(row.split(',').count(), 18);
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields[0], "0");
        assert_eq!(fields[3], "10");
        assert_eq!(fields[4], "4");
        assert_eq!(fields[7], "4");
        assert_eq!(fields[10], "1");
        assert_eq!(fields[13], "j0");
    }

    #[test]
    fn test_gantt_has_one_rectangle_per_interval() {
        let logger = logged_run();
        let figure = logger.get_gantt_representation();
        let data = figure["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["x"][1], serde_json::json!(10.0));
        assert_eq!(data[0]["y"][2], serde_json::json!(4.0));
    }

    #[test]
    fn test_jobs_utilization_against_reference() {
        let fast = logged_run();
        let mut slow = logged_run();
        slow.job_events.get_mut("0:j0").unwrap().finish_time = 20.0;

        let points = slow.get_jobs_utilization(&fast);
        let point = &points["0:j0"];
        assert!((point.speedup - 0.5).abs() < 1e-12);
        assert!((point.turnaround - 0.5).abs() < 1e-12);
        assert_eq!(point.waiting, 0.0);
    }
}
