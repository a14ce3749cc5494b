pub mod command;
pub mod matrix;
pub mod run_context;
#[allow(clippy::module_inception)]
pub mod runner;
pub mod step_context;

pub use run_context::{
    job_executor, GithubContext, JobContext, MappableOutput, RunContext, RunContextHandle,
    StepResult,
};
pub use runner::{ExecutionReport, JobReport, Runner};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::workflow::{Job, Workflow};

/// Engine-wide configuration, shared read-only between every run context.
#[derive(Debug, Clone)]
pub struct Config {
    pub actor: String,
    pub workdir: PathBuf,
    pub bind_workdir: bool,
    pub event_name: String,
    pub event_path: Option<PathBuf>,
    pub default_branch: String,
    pub reuse_containers: bool,
    pub force_pull: bool,
    pub log_output: bool,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub platforms: HashMap<String, String>,
    pub privileged: bool,
    pub userns_mode: String,
    pub container_architecture: String,
    pub container_daemon_socket: String,
    pub container_cap_add: Vec<String>,
    pub container_cap_drop: Vec<String>,
    pub use_git_ignore: bool,
    pub github_instance: String,
    pub force_remote_checkout: bool,
    pub github_context_base: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            actor: String::new(),
            workdir: PathBuf::from("."),
            bind_workdir: false,
            event_name: "push".to_string(),
            event_path: None,
            default_branch: String::new(),
            reuse_containers: false,
            force_pull: false,
            log_output: false,
            env: HashMap::new(),
            secrets: HashMap::new(),
            platforms: HashMap::new(),
            privileged: false,
            userns_mode: String::new(),
            container_architecture: String::new(),
            container_daemon_socket: String::new(),
            container_cap_add: Vec::new(),
            container_cap_drop: Vec::new(),
            use_git_ignore: true,
            github_instance: "github.com".to_string(),
            force_remote_checkout: false,
            github_context_base: None,
        }
    }
}

impl Config {
    /// The path the host working directory appears at inside the container.
    /// Unix paths map through unchanged; Windows drive letters become a
    /// lowercase root directory.
    pub fn container_workdir(&self) -> String {
        let raw = self.workdir.to_string_lossy().replace('\\', "/");
        if let Some((drive, rest)) = raw.split_once(":/") {
            if drive.len() == 1 {
                return format!("/{}/{}", drive.to_lowercase(), rest);
            }
        }
        raw
    }
}

/// One job of one workflow, the unit a run context executes.
#[derive(Clone)]
pub struct Run {
    pub workflow: Arc<Workflow>,
    pub job_id: String,
}

impl Run {
    pub fn new(workflow: Arc<Workflow>, job_id: impl Into<String>) -> Self {
        Run {
            workflow,
            job_id: job_id.into(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.workflow.jobs[&self.job_id]
    }
}

impl std::fmt::Display for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow.name, self.job_id)
    }
}
