//! Runs a configured batch: fans the simulation instances out over a
//! thread pool, then feeds the recorded traces through the post-run action
//! pipeline and the comparative report.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use rayon::prelude::*;

use crate::cluster::Cluster;
use crate::core::configuration::{ConfigOptions, RunOptions};
use crate::core::sim_config::{ActionRequest, SimConfig, SimSpec};
use crate::database::Database;
use crate::engine::ComputeEngine;
use crate::error::SimError;
use crate::logger::Logger;
use crate::scheduler;
use crate::utility::perf_timer::PerfTimer;
use crate::utility::status_bar::{StatusBar, StatusBarState, StatusPrinter};

pub struct Controller<'a> {
    config: &'a ConfigOptions,
    run_options: RunOptions,
}

/// Result of one finished simulation instance.
pub struct SimResult {
    pub sim_id: usize,
    pub workload_idx: usize,
    pub scheduler: String,
    pub makespan: f64,
    pub logger: Logger,
    pub actions: Vec<ActionRequest>,
}

impl<'a> Controller<'a> {
    pub fn new(config: &'a ConfigOptions, run_options: RunOptions) -> Self {
        Self {
            config,
            run_options,
        }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        let sim_config = SimConfig::new(self.config)?;
        let total = sim_config.specs.len();

        let show_progress =
            self.config.general.progress.unwrap_or(false) || self.run_options.progress;
        let status_logger = show_progress.then(|| {
            let state = BatchStatusBarState::new(total);
            if std::io::stderr().is_terminal() {
                StatusLogger::Bar(StatusBar::new(state, Duration::from_millis(1000)))
            } else {
                StatusLogger::Printer(StatusPrinter::new(state, Duration::from_secs(5)))
            }
        });

        let mut pool = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("elise-worker-{i}"));
        if let Some(parallelism) = self.config.general.parallelism {
            pool = pool.num_threads(parallelism.get());
        }
        let pool = pool.build().context("building the worker pool")?;

        let timer = PerfTimer::new_started();
        let completed = AtomicUsize::new(0);

        log::info!("running {total} simulation instances");
        let mut results: Vec<SimResult> = pool.install(|| {
            sim_config
                .specs
                .into_par_iter()
                .map(|spec| {
                    let result = run_simulation(spec);
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(status_logger) = &status_logger {
                        status_logger.mutate_state(|state| state.done = done);
                    }
                    result
                })
                .collect::<Result<Vec<_>, SimError>>()
        })?;
        results.sort_by_key(|r| r.sim_id);

        if let Some(mut status_logger) = status_logger {
            status_logger.stop();
        }
        if self.run_options.time || self.run_options.profiling {
            log::info!(
                "batch of {total} instances took {:?}",
                timer.elapsed()
            );
        }

        self.dispatch_actions(&results);
        if self.run_options.report {
            self.report(&results);
        }
        Ok(())
    }

    /// Apply every requested post-run action. Output failures never fail
    /// the batch: the first one is reported, the rest are suppressed.
    fn dispatch_actions(&self, results: &[SimResult]) {
        let io_error_seen = AtomicBool::new(false);

        for result in results {
            for action in &result.actions {
                let out = match action.name.as_str() {
                    "export-csv" => export_csv(result, action),
                    "export-gantt" => export_gantt(result, action),
                    other => {
                        log::warn!("ignoring unknown action {other:?}");
                        Ok(())
                    }
                };
                if let Err(e) = out {
                    if !io_error_seen.swap(true, Ordering::SeqCst) {
                        log::warn!(
                            "trace output failed ({e:#}); suppressing further output errors"
                        );
                    }
                }
            }
        }
    }

    /// Compare every scheduler against the configured default, per
    /// workload instance.
    fn report(&self, results: &[SimResult]) {
        let default_name = &self.config.schedulers.default;

        let mut by_workload: BTreeMap<usize, Vec<&SimResult>> = BTreeMap::new();
        for result in results {
            by_workload.entry(result.workload_idx).or_default().push(result);
        }

        for (workload_idx, group) in by_workload {
            let Some(reference) = group.iter().find(|r| &r.scheduler == default_name) else {
                continue;
            };

            for result in &group {
                if result.sim_id == reference.sim_id {
                    log::info!(
                        "workload {workload_idx}: {} makespan {:.2} (reference)",
                        result.scheduler,
                        result.makespan
                    );
                    continue;
                }

                let points = result.logger.get_jobs_utilization(&reference.logger);
                let mean_speedup = if points.is_empty() {
                    1.0
                } else {
                    points.values().map(|p| p.speedup).sum::<f64>() / points.len() as f64
                };
                log::info!(
                    "workload {workload_idx}: {} makespan {:.2}, makespan speedup {:.3}, \
                     mean job speedup {:.3} vs {default_name}",
                    result.scheduler,
                    result.makespan,
                    reference.makespan / result.makespan,
                    mean_speedup,
                );
            }
        }
    }
}

/// Build and drive one instance to completion on the current thread.
fn run_simulation(spec: SimSpec) -> Result<SimResult, SimError> {
    let SimSpec {
        sim_id,
        workload_idx,
        scheduler: scheduler_name,
        nodes,
        socket_conf,
        jobs,
        heatmap,
        backfill_enabled,
        actions,
    } = spec;

    let scheduler = scheduler::from_name(&scheduler_name, backfill_enabled)?;
    let logger = Logger::new(scheduler.name());
    let mut engine = ComputeEngine::new(
        Database::new(jobs, heatmap),
        Cluster::new(nodes, socket_conf),
        scheduler,
        logger,
        backfill_enabled,
    );
    engine.run()?;

    log::debug!(
        "sim {sim_id} ({scheduler_name}, workload {workload_idx}) makespan {:.2}",
        engine.cluster.makespan
    );
    Ok(SimResult {
        sim_id,
        workload_idx,
        scheduler: scheduler_name,
        makespan: engine.cluster.makespan,
        logger: engine.logger,
        actions,
    })
}

fn output_file(result: &SimResult, action: &ActionRequest, ext: &str) -> std::path::PathBuf {
    let scheduler = result.scheduler.to_lowercase().replace(' ', "_");
    action
        .output_dir
        .join(format!("workload_{}_{}.{ext}", result.workload_idx, scheduler))
}

fn export_csv(result: &SimResult, action: &ActionRequest) -> anyhow::Result<()> {
    std::fs::create_dir_all(&action.output_dir)
        .with_context(|| format!("creating {}", action.output_dir.display()))?;
    let path = output_file(result, action, "csv");
    std::fs::write(&path, result.logger.get_workload())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn export_gantt(result: &SimResult, action: &ActionRequest) -> anyhow::Result<()> {
    std::fs::create_dir_all(&action.output_dir)
        .with_context(|| format!("creating {}", action.output_dir.display()))?;

    let mut figure = result.logger.get_gantt_representation();
    if let Some(width) = action.width {
        figure["layout"]["width"] = width.into();
    }
    if let Some(height) = action.height {
        figure["layout"]["height"] = height.into();
    }

    let path = output_file(result, action, "json");
    std::fs::write(&path, serde_json::to_string_pretty(&figure)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

struct BatchStatusBarState {
    start: std::time::Instant,
    done: usize,
    total: usize,
}

impl BatchStatusBarState {
    fn new(total: usize) -> Self {
        Self {
            start: std::time::Instant::now(),
            done: 0,
            total,
        }
    }
}

impl std::fmt::Display for BatchStatusBarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frac = if self.total == 0 {
            1.0
        } else {
            self.done as f32 / self.total as f32
        };
        let realtime =
            crate::utility::time::TimeParts::from_nanos(self.start.elapsed().as_nanos());
        write!(
            f,
            "{}% — simulations: {}/{}, realtime: {}",
            (frac * 100.0).round() as i8,
            self.done,
            self.total,
            realtime.fmt_hr_min_sec(),
        )
    }
}

enum StatusLogger<T: StatusBarState> {
    Printer(StatusPrinter<T>),
    Bar(StatusBar<T>),
}

impl<T: 'static + StatusBarState> StatusLogger<T> {
    pub fn mutate_state(&self, f: impl FnOnce(&mut T)) {
        match self {
            Self::Printer(x) => x.mutate_state(f),
            Self::Bar(x) => x.mutate_state(f),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Printer(x) => x.stop(),
            Self::Bar(x) => x.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::{CliOptions, ProjectFileOptions};
    use clap::Parser;
    use std::io::Write;

    fn project(output_dir: &std::path::Path, heatmap_path: &str) -> ConfigOptions {
        let project: ProjectFileOptions = serde_json::from_value(serde_json::json!({
            "name": "smoke",
            "cluster": { "nodes": 2, "socket-conf": [4] },
            "workloads": [{
                "heatmap": heatmap_path,
                "generator": {
                    "type": "keys-list",
                    "arg": [
                        { "name": "a", "procs": 8, "time": 10.0 },
                        { "name": "b", "procs": 4, "time": 1.0 },
                    ],
                },
            }],
            "schedulers": { "default": "fifo", "others": ["easy"] },
            "actions": {
                "export-csv": {
                    "workloads": "all",
                    "schedulers": "all",
                    "output-dir": output_dir.to_str().unwrap(),
                },
                "export-gantt": {
                    "workloads": "all",
                    "schedulers": ["fifo"],
                    "output-dir": output_dir.to_str().unwrap(),
                    "width": 2048,
                    "height": 1024,
                },
            },
        }))
        .unwrap();
        let options = CliOptions::try_parse_from(["elise", "p.json", "-p", "1"]).unwrap();
        ConfigOptions::new(project, &options)
    }

    #[test]
    fn test_batch_runs_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = tempfile::NamedTempFile::new().unwrap();
        write!(
            heatmap,
            r#"{{ "a": {{ "a": 1.0, "b": 0.9 }}, "b": {{ "b": 1.0, "a": 0.9 }} }}"#
        )
        .unwrap();

        let config = project(dir.path(), heatmap.path().to_str().unwrap());
        let controller = Controller::new(&config, RunOptions::default());
        controller.run().unwrap();

        let csv = dir.path().join("workload_0_fifo.csv");
        let contents = std::fs::read_to_string(csv).unwrap();
        assert!(contents.starts_with("Job Number,"));
        assert_eq!(contents.lines().count(), 3);
        assert!(dir.path().join("workload_0_easy.csv").exists());

        let gantt = dir.path().join("workload_0_fifo.json");
        let figure: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(gantt).unwrap()).unwrap();
        assert_eq!(figure["layout"]["width"], 2048);
        // only fifo was selected for the gantt action
        assert!(!dir.path().join("workload_0_easy.json").exists());
    }

    #[test]
    fn test_failed_export_does_not_fail_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = tempfile::NamedTempFile::new().unwrap();
        write!(heatmap, r#"{{ "a": {{ "a": 1.0 }} }}"#).unwrap();

        let mut config = project(dir.path(), heatmap.path().to_str().unwrap());
        // point the actions at an unwritable location
        for action in config.actions.values_mut() {
            action.output_dir = Some("/proc/elise-cannot-write-here".into());
        }
        let controller = Controller::new(&config, RunOptions::default());
        controller.run().unwrap();
    }
}
