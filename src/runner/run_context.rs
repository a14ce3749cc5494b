use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::common::{ExecutionContext, ExecutionError, Executor};
use crate::container::{
    docker_volume_remove_executor, new_shared_env, ContainerEnvironment, ContainerSpec,
    DockerEnvironment, FileEntry, HostEnvironment, LogSink, SharedEnv,
};
use crate::expressions::{ExpressionEvaluator, EXPRESSION_PATTERN, OPERATOR_PATTERN};
use crate::git;
use crate::logging::{self, LineWriter};
use crate::runner::command;
use crate::runner::step_context::StepContext;
use crate::runner::{Config, Run};
use crate::workflow::{Action, RemoteAction, Step, StepType};

const DEFAULT_ACT_PATH: &str = "/var/run/act";
const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker.sock";
const SELF_HOSTED_IMAGE: &str = "-self-hosted";
const TOOLCACHE_VOLUME: &str = "act-toolcache";

pub type RunContextHandle = Arc<Mutex<RunContext>>;

/// Locks a run context, recovering the inner state from a poisoned mutex.
pub fn lock(rc: &RunContextHandle) -> MutexGuard<'_, RunContext> {
    rc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StepResult {
    pub success: bool,
    pub outputs: HashMap<String, String>,
}

/// Renames an output across a composite-action boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappableOutput {
    pub step_id: String,
    pub output_name: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct JobContext {
    pub status: String,
    pub container: JobContainerContext,
    pub services: HashMap<String, ServiceContext>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct JobContainerContext {
    pub id: String,
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ServiceContext {
    pub id: String,
}

fn default_event() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The `github.*` context presented to workflows, mirroring the hosted
/// service's contract so off-the-shelf actions behave identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubContext {
    #[serde(default = "default_event")]
    pub event: serde_json::Value,
    pub event_path: String,
    pub workflow: String,
    pub run_id: String,
    pub run_number: String,
    pub actor: String,
    pub repository: String,
    pub event_name: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub head_ref: String,
    pub base_ref: String,
    pub token: String,
    pub workspace: String,
    pub action: String,
    pub action_path: String,
    pub action_ref: String,
    pub action_repository: String,
    pub job: String,
    pub job_name: String,
    pub repository_owner: String,
    pub retention_days: String,
    pub runner_perflog: String,
    pub runner_tracking_id: String,
}

impl Default for GithubContext {
    fn default() -> Self {
        GithubContext {
            event: default_event(),
            event_path: String::new(),
            workflow: String::new(),
            run_id: String::new(),
            run_number: String::new(),
            actor: String::new(),
            repository: String::new(),
            event_name: String::new(),
            sha: String::new(),
            git_ref: String::new(),
            head_ref: String::new(),
            base_ref: String::new(),
            token: String::new(),
            workspace: String::new(),
            action: String::new(),
            action_path: String::new(),
            action_ref: String::new(),
            action_repository: String::new(),
            job: String::new(),
            job_name: String::new(),
            repository_owner: String::new(),
            retention_days: String::new(),
            runner_perflog: String::new(),
            runner_tracking_id: String::new(),
        }
    }
}

/// Aggregate state for one job instantiation. Threaded through every stage
/// of the job pipeline behind an `Arc<Mutex<_>>`; separate jobs own separate
/// contexts and share only `Config`.
pub struct RunContext {
    pub name: String,
    pub config: Arc<Config>,
    pub run: Run,
    pub matrix: HashMap<String, serde_json::Value>,
    pub event_json: String,
    pub env: Option<SharedEnv>,
    pub extra_path: Vec<String>,
    pub current_step: String,
    pub step_results: HashMap<String, StepResult>,
    pub expr_eval: ExpressionEvaluator,
    pub job_container: Option<Arc<dyn ContainerEnvironment>>,
    pub output_mappings: HashMap<MappableOutput, MappableOutput>,
    pub job_name: String,
    pub local: bool,
    pub action_path: String,
    pub action_ref: String,
    pub action_repository: String,
    pub composite: Option<Action>,
    pub inputs: HashMap<String, serde_json::Value>,
    pub parent: Option<Weak<Mutex<RunContext>>>,
    pub github_context_base: Option<String>,
    /// Job outputs after interpolation, available once the job pipeline has
    /// run its finalisers (also on failure paths).
    pub job_outputs: IndexMap<String, String>,
    act_path: String,
}

impl RunContext {
    pub fn new(
        config: Arc<Config>,
        run: Run,
        matrix: HashMap<String, serde_json::Value>,
        event_json: String,
        name: impl Into<String>,
    ) -> Self {
        let job_name = run.job_id.clone();
        let github_context_base = config.github_context_base.clone();
        RunContext {
            name: name.into(),
            config,
            run,
            matrix,
            event_json,
            env: None,
            extra_path: Vec::new(),
            current_step: String::new(),
            step_results: HashMap::new(),
            expr_eval: ExpressionEvaluator::new(),
            job_container: None,
            output_mappings: HashMap::new(),
            job_name,
            local: false,
            action_path: String::new(),
            action_ref: String::new(),
            action_repository: String::new(),
            composite: None,
            inputs: HashMap::new(),
            parent: None,
            github_context_base,
            job_outputs: IndexMap::new(),
            act_path: String::new(),
        }
    }

    pub fn into_handle(self) -> RunContextHandle {
        let handle = Arc::new(Mutex::new(self));
        let evaluator = lock(&handle).new_expression_evaluator();
        lock(&handle).expr_eval = evaluator;
        handle
    }

    /// Child context for a composite action: a field-for-field copy with the
    /// step-scoped fields reset and a back-reference to the parent. The env
    /// map is shared by reference; callers that need isolation install a
    /// fresh map on the child.
    pub fn clone_child(this: &RunContextHandle) -> RunContextHandle {
        let parent = lock(this);
        let child = RunContext {
            name: parent.name.clone(),
            config: parent.config.clone(),
            run: parent.run.clone(),
            matrix: parent.matrix.clone(),
            event_json: parent.event_json.clone(),
            env: parent.env.clone(),
            extra_path: parent.extra_path.clone(),
            current_step: String::new(),
            step_results: HashMap::new(),
            expr_eval: parent.expr_eval.clone(),
            job_container: parent.job_container.clone(),
            output_mappings: HashMap::new(),
            job_name: parent.job_name.clone(),
            local: parent.local,
            action_path: String::new(),
            action_ref: String::new(),
            action_repository: String::new(),
            composite: None,
            inputs: HashMap::new(),
            parent: Some(Arc::downgrade(this)),
            github_context_base: parent.github_context_base.clone(),
            job_outputs: IndexMap::new(),
            act_path: parent.act_path.clone(),
        };
        drop(parent);
        Arc::new(Mutex::new(child))
    }

    pub fn display_string(&self) -> String {
        format!("{}/{}", self.run.workflow.name, self.name)
    }

    pub fn set_act_path(&mut self, act_path: impl Into<String>) {
        self.act_path = act_path.into();
    }

    pub fn get_act_path(&self) -> String {
        if self.act_path.is_empty() {
            DEFAULT_ACT_PATH.to_string()
        } else {
            self.act_path.clone()
        }
    }

    /// The job environment, built lazily from Config -> workflow -> job env
    /// (later wins). `ACT=true` is re-asserted on every call so steps can
    /// always detect local execution.
    pub fn get_env_handle(&mut self) -> SharedEnv {
        if self.env.is_none() {
            let merged = merge_maps(&[
                &self.config.env,
                &self.run.workflow.env,
                &self.run.job().env,
            ]);
            self.env = Some(new_shared_env(merged));
        }
        let env = match &self.env {
            Some(env) => env.clone(),
            None => new_shared_env(HashMap::new()),
        };
        if let Ok(mut map) = env.lock() {
            map.insert("ACT".to_string(), "true".to_string());
        }
        env
    }

    pub fn env_snapshot(&mut self) -> HashMap<String, String> {
        let env = self.get_env_handle();
        let snapshot = env.lock().map(|map| map.clone()).unwrap_or_default();
        snapshot
    }

    pub fn job_container_name(&self) -> String {
        create_container_name("act", &self.display_string())
    }

    /// Binds and mounts for the job container: the daemon socket bind, the
    /// shared toolcache volume, the per-job env volume, and either a
    /// workdir bind or a per-job workspace volume.
    pub fn get_binds_and_mounts(&self) -> (Vec<String>, HashMap<String, String>) {
        let name = self.job_container_name();

        let socket = if self.config.container_daemon_socket.is_empty() {
            DEFAULT_DAEMON_SOCKET
        } else {
            &self.config.container_daemon_socket
        };

        let mut binds = vec![format!("{}:{}", socket, DEFAULT_DAEMON_SOCKET)];

        let mut mounts = HashMap::new();
        mounts.insert(TOOLCACHE_VOLUME.to_string(), "/toolcache".to_string());
        mounts.insert(format!("{}-env", name), self.get_act_path());

        if self.config.bind_workdir {
            // delegated consistency cuts bind-mount sync cost on macOS
            let bind_modifiers = if cfg!(target_os = "macos") {
                ":delegated"
            } else {
                ""
            };
            binds.push(format!(
                "{}:{}{}",
                self.config.workdir.to_string_lossy(),
                self.config.container_workdir(),
                bind_modifiers
            ));
        } else {
            mounts.insert(name, self.config.container_workdir());
        }

        (binds, mounts)
    }

    /// Host-side scratch root: `$XDG_CACHE_HOME`, else `~/.cache`, else the
    /// current directory, joined with `act`.
    pub fn action_cache_dir(&self) -> PathBuf {
        let cache = std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
            .unwrap_or_else(|| PathBuf::from("."));
        cache.join("act")
    }

    /// Resolve the runtime image for this job. A `container:` block wins;
    /// otherwise the first `runs-on` label with a platform mapping. Empty
    /// means the job cannot run here.
    pub fn platform_image(&self) -> String {
        let job = self.run.job();

        if let Some(image) = job.container_image() {
            return self.expr_eval.interpolate(image);
        }

        let labels = match job.runs_on() {
            Some(labels) => labels,
            None => {
                logging::error(&format!(
                    "'runs-on' key not defined in {}",
                    self.display_string()
                ));
                return String::new();
            }
        };

        for label in labels {
            let platform_name = self.expr_eval.interpolate(label).to_lowercase();
            if let Some(image) = self.config.platforms.get(&platform_name) {
                if !image.is_empty() {
                    return image.clone();
                }
            }
        }

        String::new()
    }

    /// The hostname requested through `container.options`, parsed with
    /// POSIX shell tokenisation. Malformed options yield an empty hostname.
    pub fn hostname(&self) -> String {
        let options = match self.run.job().container() {
            Some(container) => container.options.clone(),
            None => return String::new(),
        };
        if options.is_empty() {
            return String::new();
        }

        let tokens = match shell_words::split(&options) {
            Ok(tokens) => tokens,
            Err(_) => {
                logging::warning(&format!("Cannot parse container options: {}", options));
                return String::new();
            }
        };

        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            if token == "-h" || token == "--hostname" {
                return iter.next().unwrap_or_default();
            }
            if let Some(value) = token.strip_prefix("--hostname=") {
                return value.to_string();
            }
        }
        String::new()
    }

    /// A job is enabled iff its `if:` expression holds and a platform image
    /// resolves. Disabled jobs consume no container resources.
    pub fn is_enabled(&self, ctx: &ExecutionContext) -> bool {
        let job = self.run.job();

        let run_job = match self.eval_bool(&job.if_expr) {
            Ok(run_job) => run_job,
            Err(_) => {
                ctx.log_error(&format!(
                    "Error in if: expression - {}",
                    job.name.as_deref().unwrap_or(&self.job_name)
                ));
                return false;
            }
        };
        if !run_job {
            ctx.log_debug(&format!(
                "Skipping job '{}' due to '{}'",
                self.job_name, job.if_expr
            ));
            return false;
        }

        let image = self.platform_image();
        if image.is_empty() {
            if let Some(labels) = job.runs_on() {
                for label in labels {
                    let platform_name = self.expr_eval.interpolate(label);
                    ctx.log_info(&format!(
                        "🚧 Skipping unsupported platform -- Try running with `-P {}=...`",
                        platform_name
                    ));
                }
            } else {
                logging::error(&format!(
                    "'runs-on' key not defined in {}",
                    self.display_string()
                ));
            }
            return false;
        }
        true
    }

    /// Evaluate an `if:` expression to a boolean, reproducing the hosted
    /// service's coercion quirks (see the quoting rule below).
    pub fn eval_bool(&self, expr: &str) -> Result<bool, ExecutionError> {
        static SPLIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
            Regex::new(&format!(
                r"{}|(?:==|!=|<=|>=|<|>|&&|\|\||!)|\S+",
                EXPRESSION_PATTERN.as_str()
            ))
            .unwrap()
        });

        let trimmed = expr.trim();
        if trimmed.starts_with('!') {
            return Err(ExecutionError::Expression(
                "expressions starting with ! must be wrapped in ${{ }}".to_string(),
            ));
        }
        if trimmed.is_empty() {
            return Ok(true);
        }

        let parts: Vec<&str> = SPLIT_PATTERN.find_iter(expr).map(|m| m.as_str()).collect();
        let mut evaluated_parts = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            if OPERATOR_PATTERN.is_match(part) {
                evaluated_parts.push(part.to_string());
                continue;
            }

            let (mut interpolated, is_string) = self.expr_eval.interpolate_with_string_check(part);

            // The hosted parser treats "false" coming out of a context as a
            // string, not a boolean, so env.SOMETHING set to false would
            // still gate true. Quote it so the evaluator sees the string.
            if EXPRESSION_PATTERN.is_match(part)
                && !part.contains('!')
                && interpolated == "false"
                && (is_string || previous_or_next_part_is_operator(i, &parts))
            {
                interpolated = format!("'{}'", interpolated);
            }

            evaluated_parts.push(interpolated);
        }

        let joined = evaluated_parts.join(" ");
        let (value, _) = self.expr_eval.evaluate(&format!("Boolean({})", joined))?;
        logging::debug(&format!("expression '{}' evaluated to '{}'", expr, value));
        Ok(value == "true")
    }

    pub fn job_context(&self) -> JobContext {
        let mut status = "success";
        for result in self.step_results.values() {
            if !result.success {
                status = "failure";
                break;
            }
        }

        let container = self
            .job_container
            .as_ref()
            .and_then(|container| container.id())
            .map(|id| JobContainerContext {
                id,
                network: String::new(),
            })
            .unwrap_or_default();

        JobContext {
            status: status.to_string(),
            container,
            services: HashMap::new(),
        }
    }

    pub fn github_context(&self) -> GithubContext {
        let ghc = GithubContext {
            event: default_event(),
            event_path: format!("{}/workflow/event.json", self.get_act_path()),
            workflow: self.run.workflow.name.clone(),
            run_id: self.config.env.get("GITHUB_RUN_ID").cloned().unwrap_or_default(),
            run_number: self
                .config
                .env
                .get("GITHUB_RUN_NUMBER")
                .cloned()
                .unwrap_or_default(),
            actor: self.config.actor.clone(),
            event_name: self.config.event_name.clone(),
            workspace: self.config.container_workdir(),
            action: self.current_step.clone(),
            token: self.config.secrets.get("GITHUB_TOKEN").cloned().unwrap_or_default(),
            action_path: self.action_path.clone(),
            action_ref: self.action_ref.clone(),
            action_repository: self.action_repository.clone(),
            job: self.job_name.clone(),
            job_name: self.job_name.clone(),
            repository_owner: self
                .config
                .env
                .get("GITHUB_REPOSITORY_OWNER")
                .cloned()
                .unwrap_or_default(),
            retention_days: self
                .config
                .env
                .get("GITHUB_RETENTION_DAYS")
                .cloned()
                .unwrap_or_default(),
            runner_perflog: self.config.env.get("RUNNER_PERFLOG").cloned().unwrap_or_default(),
            runner_tracking_id: self
                .config
                .env
                .get("RUNNER_TRACKING_ID")
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        };

        if let Some(base) = &self.github_context_base {
            if let Ok(parsed) = serde_json::from_str::<GithubContext>(base) {
                return parsed;
            }
        }

        self.apply_github_defaults(ghc)
    }

    fn apply_github_defaults(&self, mut ghc: GithubContext) -> GithubContext {
        if ghc.run_id.is_empty() {
            ghc.run_id = "1".to_string();
        }
        if ghc.run_number.is_empty() {
            ghc.run_number = "1".to_string();
        }
        if ghc.retention_days.is_empty() {
            ghc.retention_days = "0".to_string();
        }
        if ghc.runner_perflog.is_empty() {
            ghc.runner_perflog = "/dev/null".to_string();
        }
        if ghc.actor.is_empty() {
            ghc.actor = "runlet".to_string();
        }

        let repo_path = self.config.workdir.as_path();
        match git::find_github_repo(repo_path, &self.config.github_instance) {
            Ok(repo) => {
                if ghc.repository_owner.is_empty() {
                    ghc.repository_owner = repo
                        .split('/')
                        .next()
                        .unwrap_or_default()
                        .to_string();
                }
                ghc.repository = repo;
            }
            Err(err) => logging::warning(&format!("unable to get git repo: {}", err)),
        }

        match git::find_git_revision(repo_path) {
            Ok(sha) => ghc.sha = sha,
            Err(err) => logging::warning(&format!("unable to get git revision: {}", err)),
        }

        if !self.event_json.is_empty() {
            match serde_json::from_str(&self.event_json) {
                Ok(event) => ghc.event = event,
                Err(err) => logging::error(&format!(
                    "Unable to parse event '{}': {}",
                    self.event_json, err
                )),
            }
        }

        let event_ref = ghc
            .event
            .get(&ghc.event_name)
            .and_then(|event| event.get("ref"))
            .and_then(|value| value.as_str())
            .map(str::to_string);
        if let Some(event_ref) = event_ref {
            ghc.git_ref = event_ref;
        } else {
            match git::find_git_ref(repo_path) {
                Ok(git_ref) => ghc.git_ref = git_ref,
                Err(err) => logging::warning(&format!("unable to get git ref: {}", err)),
            }

            let branch = if self.config.default_branch.is_empty() {
                "master".to_string()
            } else {
                self.config.default_branch.clone()
            };
            with_default_branch(&branch, &mut ghc.event);
        }

        if ghc.event_name == "pull_request" {
            ghc.base_ref = nested_str(&ghc.event, &["pull_request", "base", "ref"]);
            ghc.head_ref = nested_str(&ghc.event, &["pull_request", "head", "ref"]);
        }

        ghc
    }

    /// Overlay the enumerated `GITHUB_*`/`RUNNER_*` variables onto an env
    /// map. Applying this twice is the same as applying it once.
    pub fn with_github_env(&self, env: &mut HashMap<String, String>) {
        let github = self.github_context();
        let act_path = self.get_act_path();

        env.insert("CI".to_string(), "true".to_string());
        env.insert("GITHUB_ENV".to_string(), format!("{}/workflow/envs.txt", act_path));
        env.insert("GITHUB_PATH".to_string(), format!("{}/workflow/paths.txt", act_path));
        env.insert("GITHUB_WORKFLOW".to_string(), github.workflow.clone());
        env.insert("GITHUB_RUN_ID".to_string(), github.run_id.clone());
        env.insert("GITHUB_RUN_NUMBER".to_string(), github.run_number.clone());
        env.insert("GITHUB_ACTION".to_string(), github.action.clone());
        if !github.action_path.is_empty() {
            env.insert("GITHUB_ACTION_PATH".to_string(), github.action_path.clone());
        }
        env.insert("GITHUB_ACTIONS".to_string(), "true".to_string());
        env.insert("GITHUB_ACTOR".to_string(), github.actor.clone());
        env.insert("GITHUB_REPOSITORY".to_string(), github.repository.clone());
        env.insert("GITHUB_EVENT_NAME".to_string(), github.event_name.clone());
        env.insert("GITHUB_EVENT_PATH".to_string(), github.event_path.clone());
        env.insert("GITHUB_WORKSPACE".to_string(), github.workspace.clone());
        env.insert("GITHUB_SHA".to_string(), github.sha.clone());
        env.insert("GITHUB_REF".to_string(), github.git_ref.clone());
        env.insert("GITHUB_TOKEN".to_string(), github.token.clone());
        env.insert("GITHUB_ACTION_REF".to_string(), github.action_ref.clone());
        env.insert(
            "GITHUB_ACTION_REPOSITORY".to_string(),
            github.action_repository.clone(),
        );
        env.insert("GITHUB_BASE_REF".to_string(), github.base_ref.clone());
        env.insert("GITHUB_HEAD_REF".to_string(), github.head_ref.clone());
        env.insert("GITHUB_JOB".to_string(), self.job_name.clone());
        env.insert(
            "GITHUB_REPOSITORY_OWNER".to_string(),
            github.repository_owner.clone(),
        );
        env.insert(
            "GITHUB_RETENTION_DAYS".to_string(),
            github.retention_days.clone(),
        );
        env.insert("RUNNER_PERFLOG".to_string(), github.runner_perflog.clone());
        env.insert(
            "RUNNER_TRACKING_ID".to_string(),
            github.runner_tracking_id.clone(),
        );

        if self.config.github_instance == "github.com" {
            env.insert(
                "GITHUB_SERVER_URL".to_string(),
                "https://github.com".to_string(),
            );
            env.insert(
                "GITHUB_API_URL".to_string(),
                "https://api.github.com".to_string(),
            );
            env.insert(
                "GITHUB_GRAPHQL_URL".to_string(),
                "https://api.github.com/graphql".to_string(),
            );
        } else {
            env.insert(
                "GITHUB_SERVER_URL".to_string(),
                format!("https://{}", self.config.github_instance),
            );
            env.insert(
                "GITHUB_API_URL".to_string(),
                format!("https://{}/api/v3", self.config.github_instance),
            );
            env.insert(
                "GITHUB_GRAPHQL_URL".to_string(),
                format!("https://{}/api/graphql", self.config.github_instance),
            );
        }

        if let Some(labels) = self.run.job().runs_on() {
            for label in labels {
                let platform_name = self.expr_eval.interpolate(label);
                if platform_name.is_empty() {
                    continue;
                }
                if platform_name == "ubuntu-latest" {
                    // pinned: there is no way to resolve 'latest' locally
                    env.insert("ImageOS".to_string(), "ubuntu20".to_string());
                } else {
                    let trimmed = platform_name.replacen('-', "", 1);
                    let image_os = trimmed.split('.').next().unwrap_or_default().to_string();
                    env.insert("ImageOS".to_string(), image_os);
                }
            }
        }
    }

    /// Build a fresh evaluator bound to the current context state.
    pub fn new_expression_evaluator(&mut self) -> ExpressionEvaluator {
        let env = self.env_snapshot();
        self.expression_evaluator_with_env(&env)
    }

    /// Build an evaluator whose `env` context is a step-scoped map.
    pub fn expression_evaluator_with_env(
        &mut self,
        env: &HashMap<String, String>,
    ) -> ExpressionEvaluator {
        let github = self.github_context();
        let job = self.job_context();

        let runner = serde_json::json!({
            "os": env.get("RUNNER_OS").cloned().unwrap_or_else(|| "Linux".to_string()),
            "temp": env.get("RUNNER_TEMP").cloned().unwrap_or_else(|| "/tmp".to_string()),
            "tool_cache": env
                .get("RUNNER_TOOL_CACHE")
                .cloned()
                .unwrap_or_else(|| "/opt/hostedtoolcache".to_string()),
        });

        ExpressionEvaluator::new()
            .with_context("github", json_value(&github))
            .with_context("env", json_value(env))
            .with_context("job", json_value(&job))
            .with_context("steps", json_value(&self.step_results))
            .with_context("matrix", json_value(&self.matrix))
            .with_context("runner", runner)
            .with_context("inputs", json_value(&self.inputs))
            .with_context("secrets", json_value(&self.config.secrets))
    }

    /// If the job checks out the repository this engine already has locally,
    /// return the in-container path the workspace should be copied to.
    pub fn local_checkout_path(&self) -> (String, bool) {
        if self.config.force_remote_checkout {
            return (String::new(), false);
        }
        let ghc = self.github_context();
        for step in &self.run.job().steps {
            if is_local_checkout(&ghc, step) {
                return (
                    step.with.get("path").cloned().unwrap_or_default(),
                    true,
                );
            }
        }
        (String::new(), false)
    }
}

fn is_local_checkout(ghc: &GithubContext, step: &Step) -> bool {
    if step.step_type() != StepType::UsesActionRemote {
        return false;
    }
    let uses = match &step.uses {
        Some(uses) => uses,
        None => return false,
    };
    let remote = match RemoteAction::parse(uses) {
        Some(remote) => remote,
        None => return false,
    };
    if !remote.is_checkout() {
        return false;
    }
    if let Some(repository) = step.with.get("repository") {
        if *repository != ghc.repository {
            return false;
        }
    }
    if let Some(git_ref) = step.with.get("ref") {
        if *git_ref != ghc.git_ref {
            return false;
        }
    }
    true
}

fn json_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn nested_str(value: &serde_json::Value, keys: &[&str]) -> String {
    let mut current = value;
    for key in keys {
        current = match current.get(key) {
            Some(next) => next,
            None => return String::new(),
        };
    }
    current.as_str().unwrap_or_default().to_string()
}

fn with_default_branch(branch: &str, event: &mut serde_json::Value) {
    let map = match event.as_object_mut() {
        Some(map) => map,
        None => {
            logging::warning(&format!("unable to set default branch to {}", branch));
            return;
        }
    };

    let repo = map
        .entry("repository".to_string())
        .or_insert_with(default_event);
    match repo.as_object_mut() {
        Some(repo) => {
            repo.entry("default_branch".to_string())
                .or_insert_with(|| serde_json::Value::String(branch.to_string()));
        }
        None => logging::warning(&format!("unable to set default branch to {}", branch)),
    }
}

fn previous_or_next_part_is_operator(i: usize, parts: &[&str]) -> bool {
    let mut operator = false;
    if i > 0 {
        operator = OPERATOR_PATTERN.is_match(parts[i - 1]);
    }
    if i + 1 < parts.len() {
        operator = operator || OPERATOR_PATTERN.is_match(parts[i + 1]);
    }
    operator
}

pub fn merge_maps(maps: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    for map in maps {
        for (key, value) in *map {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Deterministic container name: `<prefix>-<sanitised name>` with the
/// user-derived part capped at 30 ASCII characters, no `--` runs and no
/// edge dashes. A trailing `-<digits>` matrix suffix survives truncation so
/// parallel matrix jobs cannot collide.
pub fn create_container_name(prefix: &str, name: &str) -> String {
    static PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-zA-Z0-9]").unwrap());
    static MATRIX_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new("-[0-9]+$").unwrap());

    let sanitized = PATTERN.replace_all(name, "-").to_string();
    let trimmed = match MATRIX_SUFFIX.find(&sanitized) {
        Some(suffix) => {
            let limit = 30usize.saturating_sub(suffix.as_str().len());
            format!(
                "{}{}",
                trim_to_len(&sanitized[..suffix.start()], limit),
                suffix.as_str()
            )
        }
        None => trim_to_len(&sanitized, 30),
    };

    let mut joined = format!("{}-{}", prefix, trimmed);
    while joined.contains("--") {
        joined = joined.replace("--", "-");
    }
    joined.trim_matches('-').to_string()
}

fn trim_to_len(s: &str, l: usize) -> String {
    if s.len() > l {
        s[..l].to_string()
    } else {
        s.to_string()
    }
}

fn workflow_files(event_json: String) -> Vec<FileEntry> {
    vec![
        FileEntry {
            name: "workflow/event.json".to_string(),
            mode: 0o644,
            body: event_json,
        },
        FileEntry {
            name: "workflow/envs.txt".to_string(),
            mode: 0o666,
            body: String::new(),
        },
        FileEntry {
            name: "workflow/paths.txt".to_string(),
            mode: 0o666,
            body: String::new(),
        },
    ]
}

fn new_log_sink(rc: &RunContextHandle) -> LogSink {
    let log_output = lock(rc).config.log_output;
    let writer = LineWriter::new()
        .with_handler(command::command_handler(rc.clone()))
        .with_handler(move |line| {
            if log_output {
                logging::info(line);
            } else {
                logging::debug(line);
            }
            true
        });
    Arc::new(Mutex::new(writer))
}

/// The executor for one whole job: matrix banner, container provisioning,
/// every step in order; outputs interpolation and container teardown run
/// unconditionally at the end, and the whole pipeline is gated on
/// enabledness.
pub fn job_executor(rc: &RunContextHandle) -> Executor {
    let steps = {
        let guard = lock(rc);
        guard.run.job().steps.clone()
    };

    let mut stages: Vec<Executor> = Vec::new();

    let matrix_rc = rc.clone();
    stages.push(Executor::from_fn(move |ctx| {
        let rc = matrix_rc.clone();
        async move {
            let matrix = {
                let guard = lock(&rc);
                guard.matrix.clone()
            };
            if !matrix.is_empty() {
                ctx.log_info(&format!("🧪 Matrix: {:?}", matrix));
            }
            Ok(())
        }
    }));

    stages.push(start_job_container(rc));

    for (i, mut step) in steps.into_iter().enumerate() {
        if step.id.is_empty() {
            step.id = i.to_string();
        }
        stages.push(new_step_executor(rc.clone(), step));
    }

    let enabled_rc = rc.clone();
    Executor::pipeline(stages)
        .finally(interpolate_outputs(rc))
        .finally(stop_job_container(rc))
        .if_cond(move |ctx| lock(&enabled_rc).is_enabled(ctx))
}

/// The executor for the steps of a composite action, run inside a cloned
/// child context.
pub fn composite_executor(rc: &RunContextHandle) -> Executor {
    let steps = {
        let guard = lock(rc);
        guard
            .composite
            .as_ref()
            .map(|action| action.runs.steps.clone())
            .unwrap_or_default()
    };

    let mut stages: Vec<Executor> = Vec::new();
    for (i, mut step) in steps.into_iter().enumerate() {
        if step.id.is_empty() {
            step.id = i.to_string();
        }
        stages.push(new_step_executor(rc.clone(), step));
    }
    Executor::pipeline(stages)
}

/// Provision the job's execution environment. The `-self-hosted` sentinel
/// selects host-executor mode; anything else creates a container and runs
/// the provisioning sub-pipeline against it.
pub fn start_job_container(rc: &RunContextHandle) -> Executor {
    let image = {
        let guard = lock(rc);
        guard.platform_image()
    };

    if image == SELF_HOSTED_IMAGE {
        return start_host_environment(rc.clone());
    }
    start_container_environment(rc.clone(), image)
}

fn start_host_environment(rc: RunContextHandle) -> Executor {
    Executor::from_fn(move |ctx| {
        let rc = rc.clone();
        async move {
            let log = new_log_sink(&rc);

            let (cache_dir, workdir, use_git_ignore, bind_workdir, event_json) = {
                let guard = lock(&rc);
                (
                    guard.action_cache_dir(),
                    guard.config.workdir.to_string_lossy().to_string(),
                    guard.config.use_git_ignore,
                    guard.config.bind_workdir,
                    guard.event_json.clone(),
                )
            };

            let scratch = cache_dir.join(Uuid::new_v4().to_string());
            let act_path = scratch.join("act");
            let host_path = scratch.join("hostexecutor");
            create_open_dir(&act_path)?;
            create_open_dir(&host_path)?;

            let cleanup_target = scratch.clone();
            let environment = HostEnvironment::new(
                host_path.clone(),
                move || {
                    let _ = std::fs::remove_dir_all(&cleanup_target);
                },
                log,
            );
            let container: Arc<dyn ContainerEnvironment> = Arc::new(environment);

            let act_path_str = act_path.to_string_lossy().to_string();
            let (copy_to, copy_workspace) = {
                let mut guard = lock(&rc);
                guard.set_act_path(act_path_str.clone());
                guard.job_container = Some(container.clone());
                guard.local = true;

                let env = guard.get_env_handle();
                if let Ok(mut env) = env.lock() {
                    env.insert(
                        "RUNNER_TOOL_CACHE".to_string(),
                        act_path.join("tool_cache").to_string_lossy().to_string(),
                    );
                    env.insert("RUNNER_OS".to_string(), std::env::consts::OS.to_string());
                    env.insert(
                        "RUNNER_TEMP".to_string(),
                        std::env::temp_dir().to_string_lossy().to_string(),
                    );
                    for (key, value) in std::env::vars() {
                        env.insert(key, value);
                    }
                }

                if bind_workdir {
                    (String::new(), false)
                } else {
                    let (path, copy) = guard.local_checkout_path();
                    (
                        host_path.join(path).to_string_lossy().to_string(),
                        copy,
                    )
                }
            };

            Executor::pipeline(vec![
                container
                    .copy_dir(copy_to, workdir, use_git_ignore)
                    .if_bool(copy_workspace),
                container.copy(format!("{}/", act_path_str), workflow_files(event_json)),
            ])
            .run(&ctx)
            .await
        }
    })
}

fn start_container_environment(rc: RunContextHandle, image: String) -> Executor {
    let hostname = {
        let guard = lock(&rc);
        guard.hostname()
    };

    Executor::from_fn(move |ctx| {
        let rc = rc.clone();
        let image = image.clone();
        let hostname = hostname.clone();
        async move {
            ctx.log_info(&format!("🚀 Start image={}", image));
            let log = new_log_sink(&rc);

            let (spec, act_path, event_json, config, copy_to, copy_workspace, exec_env) = {
                let mut guard = lock(&rc);
                let name = guard.job_container_name();
                let (binds, mounts) = guard.get_binds_and_mounts();

                let env_list = vec![
                    "RUNNER_TOOL_CACHE=/opt/hostedtoolcache".to_string(),
                    "RUNNER_OS=Linux".to_string(),
                    "RUNNER_TEMP=/tmp".to_string(),
                ];

                let spec = ContainerSpec {
                    cmd: Vec::new(),
                    entrypoint: vec![
                        "/usr/bin/tail".to_string(),
                        "-f".to_string(),
                        "/dev/null".to_string(),
                    ],
                    working_dir: guard.config.container_workdir(),
                    image: image.clone(),
                    username: guard
                        .config
                        .secrets
                        .get("DOCKER_USERNAME")
                        .cloned()
                        .unwrap_or_default(),
                    password: guard
                        .config
                        .secrets
                        .get("DOCKER_PASSWORD")
                        .cloned()
                        .unwrap_or_default(),
                    name,
                    env: env_list,
                    mounts,
                    binds,
                    network_mode: "host".to_string(),
                    privileged: guard.config.privileged,
                    userns_mode: guard.config.userns_mode.clone(),
                    platform: guard.config.container_architecture.clone(),
                    hostname,
                };

                let (copy_to, copy_workspace) = if guard.config.bind_workdir {
                    (String::new(), false)
                } else {
                    let (path, copy) = guard.local_checkout_path();
                    (join_container_path(&guard.config.container_workdir(), &path), copy)
                };

                (
                    spec,
                    guard.get_act_path(),
                    guard.event_json.clone(),
                    guard.config.clone(),
                    copy_to,
                    copy_workspace,
                    guard.env_snapshot(),
                )
            };

            // a handle we cannot construct is fatal for the job
            let environment = DockerEnvironment::new(spec, log)?;
            let container: Arc<dyn ContainerEnvironment> = Arc::new(environment);

            let env_handle = {
                let mut guard = lock(&rc);
                guard.job_container = Some(container.clone());
                guard.get_env_handle()
            };

            let workdir_src = config.workdir.to_string_lossy().to_string();
            Executor::pipeline(vec![
                container.pull(config.force_pull),
                stop_job_container(&rc),
                container.create(
                    config.container_cap_add.clone(),
                    config.container_cap_drop.clone(),
                ),
                container.start(false),
                container.update_from_image_env(env_handle.clone()),
                container.update_from_env("/etc/environment".to_string(), env_handle.clone()),
                container.exec(
                    vec![
                        "mkdir".to_string(),
                        "-m".to_string(),
                        "0777".to_string(),
                        "-p".to_string(),
                        act_path.clone(),
                    ],
                    String::new(),
                    exec_env,
                    "root".to_string(),
                    String::new(),
                ),
                container
                    .copy_dir(copy_to, workdir_src, config.use_git_ignore)
                    .if_bool(copy_workspace),
                container.copy(format!("{}/", act_path), workflow_files(event_json)),
            ])
            .run(&ctx)
            .await
        }
    })
}

/// Remove the job container (when set and not reused), its workspace volume
/// (container mode only), and close the handle. Runs under a detached
/// context so cancellation cannot leak resources.
pub fn stop_job_container(rc: &RunContextHandle) -> Executor {
    let rc = rc.clone();
    Executor::from_fn(move |ctx| {
        let rc = rc.clone();
        async move {
            let (container, name, reuse) = {
                let guard = lock(&rc);
                (
                    guard.job_container.clone(),
                    guard.job_container_name(),
                    guard.config.reuse_containers,
                )
            };

            let container = match container {
                Some(container) => container,
                None => return Ok(()),
            };
            if reuse {
                return Ok(());
            }

            let is_host = container.is_host();
            let teardown = container
                .remove()
                .then(
                    docker_volume_remove_executor(name, false).if_cond(move |_| !is_host),
                )
                .finally(container.close());
            teardown.run(&ctx.detached()).await
        }
    })
}

/// Interpolate the job's declared outputs with the current evaluator. Runs
/// as a finaliser so outputs are available even when a step failed.
pub fn interpolate_outputs(rc: &RunContextHandle) -> Executor {
    let rc = rc.clone();
    Executor::from_fn(move |_ctx| {
        let rc = rc.clone();
        async move {
            let mut guard = lock(&rc);
            let evaluator = guard.new_expression_evaluator();
            let declared = guard.run.job().outputs.clone();

            let mut interpolated = IndexMap::with_capacity(declared.len());
            for (key, value) in declared {
                interpolated.insert(key, evaluator.interpolate(&value));
            }
            guard.job_outputs = interpolated;
            Ok(())
        }
    })
}

/// The per-step dispatcher: bookkeeping, if-gate, env binding, delegation
/// to the step engine, result recording with continue-on-error semantics.
pub fn new_step_executor(rc: RunContextHandle, step: Step) -> Executor {
    Executor::from_fn(move |ctx| {
        let rc = rc.clone();
        let step = step.clone();
        async move {
            {
                let mut guard = lock(&rc);
                guard.current_step = step.id.clone();
                guard.step_results.insert(
                    step.id.clone(),
                    StepResult {
                        success: true,
                        outputs: HashMap::new(),
                    },
                );
            }

            let run_step = {
                let guard = lock(&rc);
                guard.eval_bool(&step.if_expr)
            };

            let mut sc = StepContext::new(rc.clone(), step.clone());

            let run_step = match run_step {
                Ok(run_step) => run_step,
                Err(err) => {
                    ctx.log_error(&format!("❌ Error in if: expression - {}", step));
                    // bind the evaluator anyway so downstream reporting can
                    // still interpolate
                    let evaluator = sc.setup_env()?;
                    {
                        let mut guard = lock(&rc);
                        guard.expr_eval = evaluator;
                        if let Some(result) = guard.step_results.get_mut(&step.id) {
                            result.success = false;
                        }
                    }
                    return Err(err);
                }
            };

            if !run_step {
                ctx.log_debug(&format!(
                    "Skipping step '{}' due to '{}'",
                    step, step.if_expr
                ));
                return Ok(());
            }

            let evaluator = sc.setup_env()?;
            lock(&rc).expr_eval = evaluator;

            ctx.log_info(&format!("⭐ Run {}", step));
            match sc.executor().run(&ctx).await {
                Ok(()) => {
                    ctx.log_info(&format!("  ✅ Success - {}", step));
                    Ok(())
                }
                Err(err) => {
                    ctx.log_error(&format!("  ❌ Failure - {}", step));
                    if step.continue_on_error {
                        ctx.log_info("Failed but continue next step");
                        if let Some(result) = lock(&rc).step_results.get_mut(&step.id) {
                            result.success = true;
                        }
                        Ok(())
                    } else {
                        if let Some(result) = lock(&rc).step_results.get_mut(&step.id) {
                            result.success = false;
                        }
                        Err(err)
                    }
                }
            }
        }
    })
}

fn join_container_path(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

fn create_open_dir(path: &std::path::Path) -> Result<(), ExecutionError> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow_str;
    use serde_json::json;

    fn test_config() -> Config {
        Config {
            workdir: PathBuf::from("/tmp/does-not-exist"),
            ..Default::default()
        }
    }

    fn test_context(workflow_yaml: &str, job_id: &str, env: &[(&str, &str)]) -> RunContextHandle {
        let workflow = Arc::new(parse_workflow_str(workflow_yaml).unwrap());
        let mut config = test_config();
        for (key, value) in env {
            config.env.insert(key.to_string(), value.to_string());
        }
        let run = Run::new(workflow, job_id);
        let rc = RunContext::new(
            Arc::new(config),
            run,
            HashMap::new(),
            String::new(),
            job_id.to_string(),
        );
        rc.into_handle()
    }

    const SIMPLE_WORKFLOW: &str = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo hi
"#;

    #[test]
    fn test_create_container_name() {
        let name = create_container_name("act", "My Great Workflow/lint-job");
        assert_eq!(name, "act-My-Great-Workflow-lint-job");
        assert!(name.starts_with("act-"));

        // matrix suffix survives truncation
        let name = create_container_name(
            "act",
            "a very long workflow name that keeps going/build-3",
        );
        assert!(name.ends_with("-3"));
        assert!(name.len() <= 30 + "act-".len());

        // invariant shape: ASCII alnum runs separated by single dashes
        let shape = Regex::new("^[A-Za-z0-9]+(-[A-Za-z0-9]+)*$").unwrap();
        for input in [
            "weird!!name//job",
            "--leading and trailing--",
            "unicode → characters/job",
            "build-42",
        ] {
            let name = create_container_name("act", input);
            assert!(shape.is_match(&name), "bad name {:?} for {:?}", name, input);
            assert!(!name.contains("--"));
        }
    }

    #[test]
    fn test_merge_maps_later_wins() {
        let mut first = HashMap::new();
        first.insert("A".to_string(), "config".to_string());
        first.insert("B".to_string(), "config".to_string());
        let mut second = HashMap::new();
        second.insert("B".to_string(), "workflow".to_string());
        second.insert("C".to_string(), "workflow".to_string());
        let mut third = HashMap::new();
        third.insert("C".to_string(), "job".to_string());

        let merged = merge_maps(&[&first, &second, &third]);
        assert_eq!(merged["A"], "config");
        assert_eq!(merged["B"], "workflow");
        assert_eq!(merged["C"], "job");
    }

    #[test]
    fn test_get_env_always_has_act_marker() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        let env = lock(&rc).env_snapshot();
        assert_eq!(env.get("ACT").unwrap(), "true");
    }

    #[test]
    fn test_eval_bool_basics() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        let guard = lock(&rc);

        assert!(guard.eval_bool("").unwrap());
        assert!(guard.eval_bool("true").unwrap());
        assert!(!guard.eval_bool("false").unwrap());
        assert!(guard.eval_bool("1 < 2").unwrap());
        assert!(guard.eval_bool("'a' == 'a'").unwrap());
        assert!(guard.eval_bool("true && true").unwrap());
        assert!(!guard.eval_bool("true && false").unwrap());
        assert!(guard.eval_bool("success()").unwrap());
    }

    #[test]
    fn test_eval_bool_rejects_leading_negation() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        let err = lock(&rc).eval_bool("!true").unwrap_err();
        assert!(err.to_string().contains("wrapped in ${{ }}"));
    }

    #[test]
    fn test_eval_bool_false_string_quirk() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        {
            let mut guard = lock(&rc);
            let env = guard.get_env_handle();
            env.lock().unwrap().insert("FLAG".to_string(), "false".to_string());
            let evaluator = guard.new_expression_evaluator();
            guard.expr_eval = evaluator;
        }
        let guard = lock(&rc);

        // context strings are quoted: even "false" gates true
        assert!(guard.eval_bool("${{ env.FLAG }}").unwrap());
        // the quoting keeps string equality intact next to operators
        assert!(guard.eval_bool("${{ env.FLAG }} == 'false'").unwrap());
        assert!(guard.eval_bool("env.FLAG == 'false'").unwrap());
        // an unset context value is null, which gates false
        assert!(!guard.eval_bool("${{ env.MISSING }}").unwrap());
    }

    #[test]
    fn test_with_github_env_is_idempotent() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[("GITHUB_RUN_ID", "77")]);
        let guard = lock(&rc);

        let mut once = HashMap::new();
        guard.with_github_env(&mut once);
        let mut twice = once.clone();
        guard.with_github_env(&mut twice);

        assert_eq!(once, twice);
        assert_eq!(once["CI"], "true");
        assert_eq!(once["GITHUB_RUN_ID"], "77");
        assert_eq!(once["GITHUB_ACTIONS"], "true");
        assert_eq!(once["ImageOS"], "ubuntu20");
        assert_eq!(once["GITHUB_SERVER_URL"], "https://github.com");
    }

    #[test]
    fn test_image_os_derivation() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-20.04
    steps:
      - run: echo hi
"#;
        let rc = test_context(workflow, "build", &[]);
        let mut env = HashMap::new();
        lock(&rc).with_github_env(&mut env);
        assert_eq!(env["ImageOS"], "ubuntu20");

        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: macos-11
    steps:
      - run: echo hi
"#;
        let rc = test_context(workflow, "build", &[]);
        let mut env = HashMap::new();
        lock(&rc).with_github_env(&mut env);
        assert_eq!(env["ImageOS"], "macos11");
    }

    #[test]
    fn test_enterprise_instance_rewrites_urls() {
        let workflow = SIMPLE_WORKFLOW;
        let flow = Arc::new(parse_workflow_str(workflow).unwrap());
        let config = Config {
            github_instance: "github.corp.example".to_string(),
            workdir: PathBuf::from("/tmp/does-not-exist"),
            ..Default::default()
        };
        let rc = RunContext::new(
            Arc::new(config),
            Run::new(flow, "build"),
            HashMap::new(),
            String::new(),
            "build",
        )
        .into_handle();

        let mut env = HashMap::new();
        lock(&rc).with_github_env(&mut env);
        assert_eq!(env["GITHUB_SERVER_URL"], "https://github.corp.example");
        assert_eq!(env["GITHUB_API_URL"], "https://github.corp.example/api/v3");
        assert_eq!(
            env["GITHUB_GRAPHQL_URL"],
            "https://github.corp.example/api/graphql"
        );
    }

    #[test]
    fn test_github_context_defaults() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        let ghc = lock(&rc).github_context();

        assert_eq!(ghc.run_id, "1");
        assert_eq!(ghc.run_number, "1");
        assert_eq!(ghc.retention_days, "0");
        assert_eq!(ghc.runner_perflog, "/dev/null");
        assert_eq!(ghc.actor, "runlet");
        assert_eq!(ghc.event_name, "push");
        assert!(ghc.event_path.ends_with("workflow/event.json"));
    }

    #[test]
    fn test_github_context_base_wins() {
        let flow = Arc::new(parse_workflow_str(SIMPLE_WORKFLOW).unwrap());
        let config = Config {
            github_context_base: Some(
                r#"{"run_id": "4242", "actor": "someone", "ref": "refs/heads/dev"}"#.to_string(),
            ),
            workdir: PathBuf::from("/tmp/does-not-exist"),
            ..Default::default()
        };
        let rc = RunContext::new(
            Arc::new(config),
            Run::new(flow, "build"),
            HashMap::new(),
            String::new(),
            "build",
        )
        .into_handle();

        let ghc = lock(&rc).github_context();
        assert_eq!(ghc.run_id, "4242");
        assert_eq!(ghc.actor, "someone");
        assert_eq!(ghc.git_ref, "refs/heads/dev");
        // the base is used wholesale: no defaulting on top
        assert_eq!(ghc.run_number, "");
    }

    #[test]
    fn test_github_context_pull_request_refs() {
        let flow = Arc::new(parse_workflow_str(SIMPLE_WORKFLOW).unwrap());
        let config = Config {
            event_name: "pull_request".to_string(),
            workdir: PathBuf::from("/tmp/does-not-exist"),
            ..Default::default()
        };
        let event = serde_json::json!({
            "pull_request": {
                "base": {"ref": "main"},
                "head": {"ref": "feature/x"},
                "ref": "refs/pull/7/merge",
            }
        });
        let rc = RunContext::new(
            Arc::new(config),
            Run::new(flow, "build"),
            HashMap::new(),
            event.to_string(),
            "build",
        )
        .into_handle();

        let ghc = lock(&rc).github_context();
        assert_eq!(ghc.base_ref, "main");
        assert_eq!(ghc.head_ref, "feature/x");
        assert_eq!(ghc.git_ref, "refs/pull/7/merge");
    }

    #[test]
    fn test_job_context_status() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        {
            let mut guard = lock(&rc);
            guard.step_results.insert(
                "0".to_string(),
                StepResult {
                    success: true,
                    outputs: HashMap::new(),
                },
            );
        }
        assert_eq!(lock(&rc).job_context().status, "success");

        {
            let mut guard = lock(&rc);
            guard.step_results.insert(
                "1".to_string(),
                StepResult {
                    success: false,
                    outputs: HashMap::new(),
                },
            );
        }
        assert_eq!(lock(&rc).job_context().status, "failure");
    }

    #[test]
    fn test_platform_image_resolution() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: [Ubuntu-Latest, fallback]
    steps:
      - run: echo hi
  contained:
    runs-on: ubuntu-latest
    container:
      image: node:16-buster-slim
    steps:
      - run: echo hi
"#;
        let flow = Arc::new(parse_workflow_str(workflow).unwrap());
        let mut config = test_config();
        config
            .platforms
            .insert("ubuntu-latest".to_string(), "catthehacker/ubuntu:act-latest".to_string());
        let config = Arc::new(config);

        let rc = RunContext::new(
            config.clone(),
            Run::new(flow.clone(), "build"),
            HashMap::new(),
            String::new(),
            "build",
        )
        .into_handle();
        // labels are matched case-insensitively
        assert_eq!(lock(&rc).platform_image(), "catthehacker/ubuntu:act-latest");

        let rc = RunContext::new(
            config,
            Run::new(flow, "contained"),
            HashMap::new(),
            String::new(),
            "contained",
        )
        .into_handle();
        assert_eq!(lock(&rc).platform_image(), "node:16-buster-slim");
    }

    #[test]
    fn test_is_enabled_skips_unmapped_platform() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: win-obscure
    steps:
      - run: echo hi
"#;
        let rc = test_context(workflow, "build", &[]);
        let ctx = ExecutionContext::new();
        assert!(!lock(&rc).is_enabled(&ctx));
        assert!(lock(&rc).job_container.is_none());
    }

    #[test]
    fn test_is_enabled_false_if_expression() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    if: "false"
    steps:
      - run: echo hi
"#;
        let flow = Arc::new(parse_workflow_str(workflow).unwrap());
        let mut config = test_config();
        config
            .platforms
            .insert("ubuntu-latest".to_string(), "node:16-buster-slim".to_string());
        let rc = RunContext::new(
            Arc::new(config),
            Run::new(flow, "build"),
            HashMap::new(),
            String::new(),
            "build",
        )
        .into_handle();

        assert!(!lock(&rc).is_enabled(&ExecutionContext::new()));
    }

    #[test]
    fn test_hostname_parsing() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    container:
      image: ubuntu:20.04
      options: --cpus 2 --hostname builder.local
    steps:
      - run: echo hi
  short:
    runs-on: ubuntu-latest
    container:
      image: ubuntu:20.04
      options: -h shorty
    steps:
      - run: echo hi
  broken:
    runs-on: ubuntu-latest
    container:
      image: ubuntu:20.04
      options: "--hostname 'unclosed"
    steps:
      - run: echo hi
"#;
        let flow = Arc::new(parse_workflow_str(workflow).unwrap());
        let config = Arc::new(test_config());

        let hostname = |job: &str| {
            let rc = RunContext::new(
                config.clone(),
                Run::new(flow.clone(), job),
                HashMap::new(),
                String::new(),
                job,
            )
            .into_handle();
            let guard = lock(&rc);
            guard.hostname()
        };

        assert_eq!(hostname("build"), "builder.local");
        assert_eq!(hostname("short"), "shorty");
        assert_eq!(hostname("broken"), "");
    }

    #[test]
    fn test_local_checkout_path() {
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v2
        with:
          path: sub/dir
      - run: make
"#;
        let rc = test_context(workflow, "build", &[]);
        let (path, copy) = lock(&rc).local_checkout_path();
        assert!(copy);
        assert_eq!(path, "sub/dir");

        // a checkout of some other repository is not local
        let workflow = r#"
name: test
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v2
        with:
          repository: somebody/else
"#;
        let rc = test_context(workflow, "build", &[]);
        let (_, copy) = lock(&rc).local_checkout_path();
        assert!(!copy);
    }

    #[test]
    fn test_clone_child_resets_step_state_and_aliases_env() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        {
            let mut guard = lock(&rc);
            guard.current_step = "3".to_string();
            guard.step_results.insert("3".to_string(), StepResult::default());
            let env = guard.get_env_handle();
            env.lock().unwrap().insert("SHARED".to_string(), "yes".to_string());
        }

        let child = RunContext::clone_child(&rc);
        {
            let guard = lock(&child);
            assert!(guard.current_step.is_empty());
            assert!(guard.step_results.is_empty());
            assert!(guard.composite.is_none());
            assert!(guard.inputs.is_empty());
            assert!(guard.parent.is_some());
        }

        // the env map is aliased until the child installs its own
        {
            let mut guard = lock(&child);
            let env = guard.get_env_handle();
            env.lock().unwrap().insert("FROM_CHILD".to_string(), "1".to_string());
        }
        let parent_env = lock(&rc).env_snapshot();
        assert_eq!(parent_env.get("SHARED").unwrap(), "yes");
        assert_eq!(parent_env.get("FROM_CHILD").unwrap(), "1");

        // replacing the child's env must not affect the parent
        {
            let mut guard = lock(&child);
            guard.env = Some(new_shared_env(HashMap::new()));
            let env = guard.get_env_handle();
            env.lock().unwrap().insert("ONLY_CHILD".to_string(), "1".to_string());
        }
        let parent_env = lock(&rc).env_snapshot();
        assert!(!parent_env.contains_key("ONLY_CHILD"));
    }

    #[test]
    fn test_get_binds_and_mounts() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        let (binds, mounts) = lock(&rc).get_binds_and_mounts();

        assert_eq!(binds[0], "/var/run/docker.sock:/var/run/docker.sock");
        assert_eq!(mounts["act-toolcache"], "/toolcache");
        let name = lock(&rc).job_container_name();
        assert_eq!(mounts[&format!("{}-env", name)], "/var/run/act");
        // no workdir bind: the workspace rides a named volume
        assert_eq!(mounts[&name], "/tmp/does-not-exist");
    }

    #[test]
    fn test_expression_evaluator_contexts() {
        let rc = test_context(SIMPLE_WORKFLOW, "build", &[]);
        {
            let mut guard = lock(&rc);
            guard.step_results.insert(
                "fmt".to_string(),
                StepResult {
                    success: true,
                    outputs: HashMap::from([(
                        "result".to_string(),
                        "clean".to_string(),
                    )]),
                },
            );
            guard.matrix.insert("os".to_string(), json!("linux"));
            let evaluator = guard.new_expression_evaluator();
            guard.expr_eval = evaluator;
        }

        let guard = lock(&rc);
        assert_eq!(
            guard.expr_eval.interpolate("${{ steps.fmt.outputs.result }}"),
            "clean"
        );
        assert_eq!(guard.expr_eval.interpolate("${{ matrix.os }}"), "linux");
        assert_eq!(guard.expr_eval.interpolate("${{ github.workflow }}"), "test");
        assert_eq!(guard.expr_eval.interpolate("${{ env.ACT }}"), "true");
    }
}
