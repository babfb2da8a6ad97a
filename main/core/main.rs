//! Process entry point: parse the CLI, load the project file, wire the
//! logger, and hand the merged configuration to the controller.

use anyhow::Context;
use clap::Parser;

use crate::core::configuration::{CliOptions, ConfigOptions, ProjectFileOptions, RunOptions};
use crate::core::controller::Controller;
use crate::core::logger as elise_logger;

/// Main entry point for the simulator.
pub fn run_elise() -> anyhow::Result<()> {
    let options = CliOptions::parse();
    let run_options = RunOptions::from_env();

    if let Some(workingdir) = &run_options.workingdir {
        std::env::set_current_dir(workingdir)
            .with_context(|| format!("entering working directory {}", workingdir.display()))?;
    }

    // read from stdin if the project filename is given as '-'
    let project_filename = match options.project.as_str() {
        "-" => "/dev/stdin",
        x => x,
    };
    let project_file = load_project_file(project_filename)
        .with_context(|| format!("failed to load project file {project_filename}"))?;

    let config = ConfigOptions::new(project_file, &options);

    if options.show_config {
        eprintln!("{config:#?}");
        return Ok(());
    }

    let log_level = config
        .general
        .log_level
        .expect("defaulted during the merge");
    elise_logger::init(log_level.into(), true).expect("logger initialized once");

    log::info!("project {:?}", config.name);
    let result = Controller::new(&config, run_options).run();
    log::logger().flush();
    result
}

fn load_project_file(filename: &str) -> anyhow::Result<ProjectFileOptions> {
    let contents = std::fs::read_to_string(filename)?;
    let project: ProjectFileOptions = serde_json::from_str(&contents)?;
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_project_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "roundtrip",
                "cluster": {{ "nodes": 1, "socket-conf": [8] }},
                "workloads": [{{
                    "heatmap": "hm.json",
                    "generator": {{ "type": "random", "arg": {{ "count": 2 }} }}
                }}],
                "schedulers": {{ "default": "fifo" }}
            }}"#
        )
        .unwrap();

        let project = load_project_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(project.name, "roundtrip");
    }

    #[test]
    fn test_malformed_project_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load_project_file(file.path().to_str().unwrap()).is_err());
    }
}
