//! Turns the merged configuration into the flat list of simulation
//! instances the controller fans out: one per (workload instance ×
//! scheduler), each carrying its own job stream, heatmap, geometry, and
//! post-run actions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::core::configuration::{
    ActionOptions, ClusterOptions, ConfigOptions, WorkloadOptions, WorkloadSource,
};
use crate::database::Heatmap;
use crate::error::SimError;
use crate::generator::{apply_distribution, generate_jobs};
use crate::jobs::Job;
use crate::scheduler;

/// A post-run output request attached to one simulation instance.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub name: String,
    pub output_dir: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Everything one simulation instance needs, self-contained and movable to
/// a worker thread.
#[derive(Debug, Clone)]
pub struct SimSpec {
    pub sim_id: usize,
    /// Index of the workload instance (repeats count separately).
    pub workload_idx: usize,
    /// The scheduler name as configured; resolved to a policy in the
    /// worker.
    pub scheduler: String,
    pub nodes: u32,
    pub socket_conf: Vec<u32>,
    pub jobs: Vec<Job>,
    pub heatmap: Heatmap,
    pub backfill_enabled: bool,
    pub actions: Vec<ActionRequest>,
}

#[derive(Debug)]
pub struct SimConfig {
    pub specs: Vec<SimSpec>,
}

impl SimConfig {
    /// Validate the configuration and materialize every instance. All
    /// configuration errors surface here, before any simulation starts.
    pub fn new(config: &ConfigOptions) -> anyhow::Result<Self> {
        let scheduler_names: Vec<String> = std::iter::once(config.schedulers.default.clone())
            .chain(config.schedulers.others.iter().cloned())
            .collect();
        for name in &scheduler_names {
            scheduler::from_name(name, config.schedulers.backfill_enabled)
                .with_context(|| format!("resolving scheduler {name:?}"))?;
        }
        for (action_name, action) in &config.actions {
            action
                .workloads
                .validate()
                .and_then(|()| action.schedulers.validate())
                .map_err(|e| SimError::Config(format!("action {action_name:?}: {e}")))?;
        }

        let mut random = Xoshiro256PlusPlus::seed_from_u64(config.general.seed.unwrap_or(1));
        let data_directory = PathBuf::from(
            config
                .general
                .data_directory
                .clone()
                .unwrap_or_else(|| "elise.data".into()),
        );

        let mut specs = Vec::new();
        let mut workload_idx = 0usize;

        for (position, workload) in config.workloads.iter().enumerate() {
            let cluster = effective_cluster(workload, config).ok_or_else(|| {
                SimError::Config(format!("workload {position} has no cluster geometry"))
            })?;
            if cluster.nodes == 0 || cluster.socket_conf.is_empty() {
                return Err(SimError::Config(format!(
                    "workload {position} has an empty cluster"
                ))
                .into());
            }
            let capacity = cluster.nodes * cluster.socket_conf.iter().sum::<u32>();

            let heatmap = load_heatmap(workload, position)?;
            let repeat = workload.repeat.unwrap_or(1).max(1);

            for _ in 0..repeat {
                // every instance draws its own generator stream off the
                // root seed, so repeats differ but the batch stays
                // reproducible
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(random.gen());

                let generator = &workload.generator;
                let mut jobs = generate_jobs(
                    &generator.gen_type,
                    &generator.arg,
                    &heatmap,
                    capacity,
                    &mut rng,
                )?;
                if let Some(distribution) = &generator.distribution {
                    apply_distribution(
                        &mut jobs,
                        &distribution.distr_type,
                        distribution.arg,
                        &mut rng,
                    )?;
                }

                for scheduler_name in &scheduler_names {
                    let actions = matching_actions(
                        &config.actions,
                        workload_idx,
                        scheduler_name,
                        &data_directory,
                    );
                    specs.push(SimSpec {
                        sim_id: specs.len(),
                        workload_idx,
                        scheduler: scheduler_name.clone(),
                        nodes: cluster.nodes,
                        socket_conf: cluster.socket_conf.clone(),
                        jobs: jobs.clone(),
                        heatmap: heatmap.clone(),
                        backfill_enabled: config.schedulers.backfill_enabled,
                        actions,
                    });
                }
                workload_idx += 1;
            }
        }

        log::info!(
            "prepared {} simulation instances ({} workload instances x {} schedulers)",
            specs.len(),
            workload_idx,
            scheduler_names.len()
        );
        Ok(Self { specs })
    }
}

fn effective_cluster<'a>(
    workload: &'a WorkloadOptions,
    config: &'a ConfigOptions,
) -> Option<&'a ClusterOptions> {
    workload.cluster.as_ref().or(config.cluster.as_ref())
}

fn load_heatmap(workload: &WorkloadOptions, position: usize) -> anyhow::Result<Heatmap> {
    let path = match (&workload.heatmap, &workload.source) {
        (Some(path), _) => path.clone(),
        (None, Some(WorkloadSource::Path(path))) => path.clone(),
        (None, Some(WorkloadSource::LoadManager(_))) | (None, Some(WorkloadSource::Db(_))) => {
            return Err(SimError::Config(format!(
                "workload {position}: load-manager and db sources need an exported heatmap file"
            ))
            .into());
        }
        (None, None) => {
            return Err(SimError::Config(format!(
                "workload {position} provides neither a heatmap nor a source"
            ))
            .into());
        }
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading heatmap file {path}"))?;
    parse_heatmap(&text).map_err(Into::into)
}

/// Parse a heatmap file: `{job: {co_job: float | null}}`.
pub fn parse_heatmap(text: &str) -> Result<Heatmap, SimError> {
    let rows: BTreeMap<String, BTreeMap<String, Option<f64>>> = serde_json::from_str(text)
        .map_err(|e| SimError::Config(format!("malformed heatmap: {e}")))?;
    Ok(Heatmap::new(rows))
}

fn matching_actions(
    actions: &BTreeMap<String, ActionOptions>,
    workload_idx: usize,
    scheduler_name: &str,
    data_directory: &std::path::Path,
) -> Vec<ActionRequest> {
    actions
        .iter()
        .filter(|(_, action)| {
            action.workloads.matches(&workload_idx)
                && action.schedulers.matches(&scheduler_name.to_string())
        })
        .map(|(name, action)| ActionRequest {
            name: name.clone(),
            output_dir: action
                .output_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_directory.to_path_buf()),
            width: action.width,
            height: action.height,
        })
        .collect()
}
