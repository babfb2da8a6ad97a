//! Configuration and CLI parsing using [serde] and [clap]. The project file
//! holds everything a batch of simulations needs (cluster geometry,
//! workloads, schedulers, post-run actions); a handful of general options
//! can be overridden from the command line.
//!
//! [schemars] extracts each general option's doc comment and default so the
//! CLI help text matches the project-file documentation. This code checks
//! format only; values (paths, scheduler names) are validated where they
//! are used, so parsing stays environment-independent.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use merge::Merge;
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

const START_HELP_TEXT: &str = "\
    Simulate batch scheduling and co-scheduling policies over a synthetic \
    HPC job stream.";

const END_HELP_TEXT: &str = "\
    The project file is JSON. Unless noted otherwise, command line options \
    override their project-file counterparts.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "elise", about = START_HELP_TEXT, after_help = END_HELP_TEXT)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
pub struct CliOptions {
    /// Path to the project file. Use '-' to read from stdin
    pub project: String,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    #[clap(flatten)]
    pub general: GeneralOptions,
}

/// Help messages used by clap for command line arguments, combining the doc
/// string with the serde default.
static GENERAL_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GeneralOptions)));

// these must all be Option types since they aren't required by the CLI, even
// if they're required in the project file
#[derive(Debug, Clone, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "General (Override project file options)")]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct GeneralOptions {
    /// Initialize randomness using seed N
    #[clap(long, value_name = "N")]
    #[clap(help = GENERAL_HELP.get("seed").unwrap().as_str())]
    pub seed: Option<u64>,

    /// How many simulation instances to run in parallel worker threads
    #[clap(long, short = 'p', value_name = "count")]
    #[clap(help = GENERAL_HELP.get("parallelism").unwrap().as_str())]
    pub parallelism: Option<NonZeroUsize>,

    /// Log level of output written on stdout
    #[clap(long, short = 'l', value_name = "level")]
    #[clap(help = GENERAL_HELP.get("log-level").unwrap().as_str())]
    pub log_level: Option<LogLevel>,

    /// Path to store simulation output
    #[clap(long, short = 'd', value_name = "path")]
    #[clap(help = GENERAL_HELP.get("data-directory").unwrap().as_str())]
    pub data_directory: Option<String>,

    /// Show batch progress on stderr
    #[clap(long, value_name = "bool")]
    #[clap(help = GENERAL_HELP.get("progress").unwrap().as_str())]
    pub progress: Option<bool>,
}

impl Default for GeneralOptions {
    fn default() -> Self {
        Self {
            seed: Some(1),
            parallelism: None,
            log_level: Some(LogLevel::Info),
            data_directory: Some("elise.data".into()),
            progress: Some(false),
        }
    }
}

impl GeneralOptions {
    /// Replace unset (`None`) values of `self` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

/// Options contained in a project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ProjectFileOptions {
    pub name: String,

    #[serde(default)]
    pub general: GeneralOptions,

    /// Cluster geometry shared by every workload that does not bring its
    /// own.
    #[serde(default)]
    pub cluster: Option<ClusterOptions>,

    pub workloads: Vec<WorkloadOptions>,

    pub schedulers: SchedulerOptions,

    #[serde(default)]
    pub actions: BTreeMap<String, ActionOptions>,
}

/// Configuration after merging command-line and project-file options.
#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub name: String,
    pub general: GeneralOptions,
    pub cluster: Option<ClusterOptions>,
    pub workloads: Vec<WorkloadOptions>,
    pub schedulers: SchedulerOptions,
    pub actions: BTreeMap<String, ActionOptions>,
}

impl ConfigOptions {
    pub fn new(project_file: ProjectFileOptions, options: &CliOptions) -> Self {
        // command line options override project file options, which override
        // the built-in defaults
        let general = options
            .general
            .clone()
            .with_defaults(project_file.general)
            .with_defaults(GeneralOptions::default());

        Self {
            name: project_file.name,
            general,
            cluster: project_file.cluster,
            workloads: project_file.workloads,
            schedulers: project_file.schedulers,
            actions: project_file.actions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClusterOptions {
    pub nodes: u32,
    pub socket_conf: Vec<u32>,
}

/// Where a workload's speedup knowledge comes from. Only plain heatmap
/// files are consumable here; pickled load managers and databases belong to
/// the outer tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub enum WorkloadSource {
    Path(String),
    LoadManager(String),
    Db(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct WorkloadOptions {
    #[serde(default)]
    pub loads_machine: Option<String>,

    #[serde(default)]
    pub loads_suite: Option<String>,

    #[serde(default)]
    pub source: Option<WorkloadSource>,

    /// Path to the pairwise speedup heatmap file; falls back to a
    /// `source: {path}` reference.
    #[serde(default)]
    pub heatmap: Option<String>,

    pub generator: GeneratorOptions,

    /// Generate this many independent instances of the workload.
    #[serde(default)]
    pub repeat: Option<u32>,

    /// Overrides the project-wide cluster geometry.
    #[serde(default)]
    pub cluster: Option<ClusterOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct GeneratorOptions {
    #[serde(rename = "type")]
    pub gen_type: String,
    pub arg: serde_json::Value,
    #[serde(default)]
    pub distribution: Option<DistributionOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DistributionOptions {
    #[serde(rename = "type")]
    pub distr_type: String,
    pub arg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SchedulerOptions {
    /// The reference policy other policies are compared against.
    pub default: String,
    #[serde(default)]
    pub others: Vec<String>,
    #[serde(default = "default_true")]
    pub backfill_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `"all"` or an explicit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector<T> {
    All(String),
    List(Vec<T>),
}

impl<T: PartialEq> Selector<T> {
    pub fn matches(&self, item: &T) -> bool {
        match self {
            Selector::All(_) => true,
            Selector::List(items) => items.contains(item),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Selector::All(tag) if tag != "all" => {
                Err(format!("expected \"all\" or a list, found {tag:?}"))
            }
            _ => Ok(()),
        }
    }
}

/// One post-run output action, applied to the selected (workload,
/// scheduler) results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ActionOptions {
    pub workloads: Selector<usize>,
    pub schedulers: Selector<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Environment switches consumed once at process start. They only gate side
/// outputs, never core behavior.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub report: bool,
    pub progress: bool,
    pub time: bool,
    pub profiling: bool,
    pub workingdir: Option<PathBuf>,
}

impl RunOptions {
    pub fn from_env() -> Self {
        Self {
            report: env_flag("ELiSE_REPORT"),
            progress: env_flag("ELiSE_PROGRESS"),
            time: env_flag("ELiSE_TIME"),
            profiling: env_flag("ELiSE_PROFILING"),
            workingdir: std::env::var_os("ELiSE_WORKINGDIR").map(PathBuf::from),
        }
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => !matches!(value.as_str(), "" | "0" | "false"),
        Err(_) => false,
    }
}

fn generate_help_strs(
    schema: schemars::schema::RootSchema,
) -> std::collections::HashMap<String, String> {
    let mut defaults = std::collections::HashMap::<String, String>::new();
    for (name, obj) in &schema.schema.object.as_ref().unwrap().properties {
        if let Some(meta) = obj.clone().into_object().metadata {
            let description = meta.description.unwrap_or_default();
            let space = if !description.is_empty() { " " } else { "" };
            match meta.default {
                Some(default) => defaults.insert(
                    name.clone(),
                    format!("{}{}[default: {}]", description, space, default),
                ),
                None => defaults.insert(name.clone(), description.to_string()),
            };
        }
    }
    defaults
}
