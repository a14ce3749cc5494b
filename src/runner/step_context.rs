use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use crate::common::{ExecutionContext, ExecutionError, Executor};
use crate::container::{new_shared_env, ContainerEnvironment, FileEntry};
use crate::expressions::ExpressionEvaluator;
use crate::runner::run_context::{
    composite_executor, lock, MappableOutput, RunContext, RunContextHandle,
};
use crate::workflow::{parse_action, Action, RemoteAction, Step, StepType};

/// Per-step execution state: the step, its scoped environment, and the run
/// context it reports into.
pub struct StepContext {
    rc: RunContextHandle,
    step: Step,
    env: HashMap<String, String>,
}

impl StepContext {
    pub fn new(rc: RunContextHandle, step: Step) -> Self {
        StepContext {
            rc,
            step,
            env: HashMap::new(),
        }
    }

    /// Build the step-scoped environment (job env, container env, step env,
    /// accumulated PATH entries, `with:` inputs, github overlay) and return
    /// an evaluator bound to it.
    pub fn setup_env(&mut self) -> Result<ExpressionEvaluator, ExecutionError> {
        let mut guard = lock(&self.rc);
        let mut env = guard.env_snapshot();

        if let Some(container) = guard.run.job().container() {
            for (key, value) in &container.env {
                env.insert(key.clone(), guard.expr_eval.interpolate(value));
            }
        }

        for (key, value) in &self.step.env {
            env.insert(key.clone(), guard.expr_eval.interpolate(value));
        }

        if !guard.extra_path.is_empty() {
            let mut elements = guard.extra_path.clone();
            if let Some(existing) = env.get("PATH") {
                elements.push(existing.clone());
            }
            env.insert("PATH".to_string(), elements.join(":"));
        }

        for (key, value) in &self.step.with {
            let name = format!(
                "INPUT_{}",
                key.to_uppercase().replace([' ', '-'], "_")
            );
            env.insert(name, guard.expr_eval.interpolate(value));
        }

        guard.with_github_env(&mut env);

        let evaluator = guard.expression_evaluator_with_env(&env);
        self.env = env;
        Ok(evaluator)
    }

    /// The executor that actually runs this step, by step kind.
    pub fn executor(&self) -> Executor {
        match self.step.step_type() {
            StepType::Run => self.run_executor(),
            StepType::UsesLocalAction => self.local_action_executor(),
            StepType::UsesActionRemote => self.remote_action_executor(),
            StepType::UsesDockerImage => {
                let uses = self.step.uses.clone().unwrap_or_default();
                Executor::from_fn(move |ctx| {
                    let uses = uses.clone();
                    async move {
                        ctx.log_warning(&format!(
                            "Docker container actions are not supported, skipping {}",
                            uses
                        ));
                        Ok(())
                    }
                })
            }
            StepType::Invalid => {
                let step = self.step.clone();
                Executor::from_fn(move |_ctx| {
                    let step = step.clone();
                    async move {
                        Err(ExecutionError::Config(format!(
                            "Step '{}' has neither 'uses' nor 'run'",
                            step
                        )))
                    }
                })
            }
        }
    }

    fn run_executor(&self) -> Executor {
        let rc = self.rc.clone();
        let step = self.step.clone();
        let env = self.env.clone();

        Executor::from_fn(move |ctx| {
            let rc = rc.clone();
            let step = step.clone();
            let env = env.clone();
            async move {
                let (container, script, act_path, workdir, shell) = {
                    let guard = lock(&rc);
                    let container = job_container(&guard)?;
                    let script = guard
                        .expr_eval
                        .interpolate(step.run.as_deref().unwrap_or(""));
                    let shell = step
                        .shell
                        .as_deref()
                        .map(|shell| guard.expr_eval.interpolate(shell))
                        .unwrap_or_default();
                    let workdir = resolve_workdir(&guard, &step);
                    (container, script, guard.get_act_path(), workdir, shell)
                };

                let script_name = format!("workflow/step-{}", sanitize_id(&step.id));
                let script_path = format!("{}/{}", act_path, script_name);
                let cmd = shell_command(&shell, &script_path);

                container
                    .copy(
                        format!("{}/", act_path),
                        vec![FileEntry {
                            name: script_name,
                            mode: 0o755,
                            body: script,
                        }],
                    )
                    .run(&ctx)
                    .await?;

                container
                    .exec(cmd, String::new(), env, String::new(), workdir)
                    .run(&ctx)
                    .await
            }
        })
    }

    fn local_action_executor(&self) -> Executor {
        let rc = self.rc.clone();
        let step = self.step.clone();
        let env = self.env.clone();

        Executor::from_fn(move |ctx| {
            let rc = rc.clone();
            let step = step.clone();
            let env = env.clone();
            async move {
                let uses = step.uses.clone().unwrap_or_default();
                let rel = uses.trim_start_matches("./").to_string();

                let (host_dir, action_base) = {
                    let guard = lock(&rc);
                    let host_dir = guard.config.workdir.join(&rel);
                    let base = if guard.local {
                        guard.config.workdir.to_string_lossy().to_string()
                    } else {
                        guard.config.container_workdir()
                    };
                    (host_dir, join_path(&base, &rel))
                };

                let action = parse_action(&host_dir)?;
                run_action(ActionInvocation {
                    rc,
                    step,
                    env,
                    action,
                    action_dir: action_base,
                    remote: None,
                    ctx,
                })
                .await
            }
        })
    }

    fn remote_action_executor(&self) -> Executor {
        let rc = self.rc.clone();
        let step = self.step.clone();
        let env = self.env.clone();

        Executor::from_fn(move |ctx| {
            let rc = rc.clone();
            let step = step.clone();
            let env = env.clone();
            async move {
                let uses = step.uses.clone().unwrap_or_default();
                let remote = RemoteAction::parse(&uses).ok_or_else(|| {
                    ExecutionError::Config(format!("Invalid action reference: {}", uses))
                })?;

                if remote.is_checkout() {
                    // the workspace was copied (or bound) at container start
                    ctx.log_info(&format!(
                        "Skipping {}: the local workspace stands in for the checkout",
                        uses
                    ));
                    return Ok(());
                }

                let (cache_dir, instance, act_path) = {
                    let guard = lock(&rc);
                    (
                        guard.action_cache_dir(),
                        guard.config.github_instance.clone(),
                        guard.get_act_path(),
                    )
                };

                let slug = format!(
                    "{}-{}-{}",
                    remote.org,
                    remote.repo,
                    sanitize_id(remote.git_ref.as_deref().unwrap_or("head"))
                );
                let checkout_dir = fetch_remote_action(&cache_dir, &remote, &instance)?;
                let host_dir = if remote.path.is_empty() {
                    checkout_dir.clone()
                } else {
                    checkout_dir.join(&remote.path)
                };
                let action = parse_action(&host_dir)?;

                // stage the fetched action inside the environment
                let staged = format!("{}/actions/{}", act_path, slug);
                let container = {
                    let guard = lock(&rc);
                    job_container(&guard)?
                };
                container
                    .copy_dir(
                        staged.clone(),
                        checkout_dir.to_string_lossy().to_string(),
                        false,
                    )
                    .run(&ctx)
                    .await?;

                let action_dir = join_path(&staged, &remote.path);
                run_action(ActionInvocation {
                    rc,
                    step,
                    env,
                    action,
                    action_dir,
                    remote: Some(remote),
                    ctx,
                })
                .await
            }
        })
    }
}

struct ActionInvocation {
    rc: RunContextHandle,
    step: Step,
    env: HashMap<String, String>,
    action: Action,
    /// The action's directory as seen from inside the execution environment.
    action_dir: String,
    remote: Option<RemoteAction>,
    ctx: ExecutionContext,
}

async fn run_action(invocation: ActionInvocation) -> Result<(), ExecutionError> {
    let ActionInvocation {
        rc,
        step,
        env,
        action,
        action_dir,
        remote,
        ctx,
    } = invocation;

    let using = action.runs.using.clone();
    match using.as_str() {
        "composite" => run_composite_action(rc, step, env, action, action_dir, remote, ctx).await,
        "node12" | "node16" | "node20" => {
            let main = action.runs.main.clone().ok_or_else(|| {
                ExecutionError::Config(format!(
                    "Action in {} declares {} but no main entry",
                    action_dir, using
                ))
            })?;
            let container = {
                let guard = lock(&rc);
                job_container(&guard)?
            };
            let main_path = join_path(&action_dir, &main);
            container
                .exec(
                    vec!["node".to_string(), main_path],
                    String::new(),
                    env,
                    String::new(),
                    String::new(),
                )
                .run(&ctx)
                .await
        }
        "docker" => {
            ctx.log_warning(&format!(
                "Docker container actions are not supported, skipping {}",
                action_dir
            ));
            Ok(())
        }
        other => Err(ExecutionError::Config(format!(
            "Unsupported action runtime '{}' in {}",
            other, action_dir
        ))),
    }
}

async fn run_composite_action(
    rc: RunContextHandle,
    step: Step,
    env: HashMap<String, String>,
    action: Action,
    action_dir: String,
    remote: Option<RemoteAction>,
    ctx: ExecutionContext,
) -> Result<(), ExecutionError> {
    let parent_step = {
        let guard = lock(&rc);
        guard.current_step.clone()
    };

    let child = RunContext::clone_child(&rc);
    {
        let mut guard = lock(&child);
        guard.composite = Some(action.clone());
        guard.action_path = action_dir.clone();
        if let Some(remote) = &remote {
            guard.action_ref = remote.git_ref.clone().unwrap_or_default();
            guard.action_repository = remote.repo_slug();
        }

        // the composite works on its own env map so its set-env commands
        // stay inside the action
        guard.env = Some(new_shared_env(env.clone()));

        let parent_eval = {
            let parent = lock(&rc);
            parent.expr_eval.clone()
        };
        let mut inputs = HashMap::new();
        for (name, input) in &action.inputs {
            if let Some(default) = &input.default {
                inputs.insert(
                    name.clone(),
                    serde_json::Value::String(parent_eval.interpolate(default)),
                );
            }
        }
        for (key, value) in &step.with {
            inputs.insert(
                key.clone(),
                serde_json::Value::String(parent_eval.interpolate(value)),
            );
        }
        guard.inputs = inputs;

        let evaluator = guard.new_expression_evaluator();
        guard.expr_eval = evaluator;
    }

    // The job container streams step output through the log sink bound to
    // the job's run context, so `::set-output::` lines emitted by the
    // composite's steps land on the parent's current step under their raw
    // names. Declared re-exports of the `${{ steps.X.outputs.Y }}` form are
    // renamed in place through the parent's mapping table.
    let mut mapped_outputs = Vec::new();
    {
        let mut guard = lock(&rc);
        for (name, output) in &action.outputs {
            if let Some((_, output_name)) = parse_steps_output_ref(&output.value) {
                guard.output_mappings.insert(
                    MappableOutput {
                        step_id: parent_step.clone(),
                        output_name,
                    },
                    MappableOutput {
                        step_id: parent_step.clone(),
                        output_name: name.clone(),
                    },
                );
                mapped_outputs.push(name.clone());
            }
        }
    }

    let result = composite_executor(&child).run(&ctx).await;

    // outputs with non-trivial expressions are interpolated in the child's
    // final state as a best effort
    let leftover: Vec<(String, String)> = {
        let mut guard = lock(&child);
        let evaluator = guard.new_expression_evaluator();
        action
            .outputs
            .iter()
            .filter(|(name, _)| !mapped_outputs.contains(*name))
            .map(|(name, output)| (name.clone(), evaluator.interpolate(&output.value)))
            .collect()
    };
    {
        let mut guard = lock(&rc);
        if let Some(step_result) = guard.step_results.get_mut(&parent_step) {
            for (name, value) in leftover {
                step_result.outputs.insert(name, value);
            }
        }
    }

    result
}

fn job_container(
    guard: &std::sync::MutexGuard<'_, RunContext>,
) -> Result<Arc<dyn ContainerEnvironment>, ExecutionError> {
    guard
        .job_container
        .clone()
        .ok_or_else(|| ExecutionError::Container("Job container is not running".to_string()))
}

fn resolve_workdir(guard: &std::sync::MutexGuard<'_, RunContext>, step: &Step) -> String {
    let workdir = match &step.working_directory {
        Some(workdir) => guard.expr_eval.interpolate(workdir),
        None => return String::new(),
    };
    if workdir.is_empty() || workdir.starts_with('/') || guard.local {
        workdir
    } else {
        join_path(&guard.config.container_workdir(), &workdir)
    }
}

/// Map a step shell to the command line that runs the staged script.
/// `{0}` templates substitute the script path; known shells get their
/// conventional flags, and the default is strict bash.
fn shell_command(shell: &str, script_path: &str) -> Vec<String> {
    if shell.contains("{0}") {
        let substituted = shell.replace("{0}", script_path);
        return shell_words::split(&substituted)
            .unwrap_or_else(|_| vec![substituted.clone()]);
    }
    match shell {
        "" | "bash" => vec![
            "bash".to_string(),
            "--noprofile".to_string(),
            "--norc".to_string(),
            "-e".to_string(),
            "-o".to_string(),
            "pipefail".to_string(),
            script_path.to_string(),
        ],
        "sh" => vec!["sh".to_string(), "-e".to_string(), script_path.to_string()],
        "python" => vec!["python".to_string(), script_path.to_string()],
        "pwsh" => vec![
            "pwsh".to_string(),
            "-command".to_string(),
            format!(". '{}'", script_path),
        ],
        other => vec![other.to_string(), script_path.to_string()],
    }
}

fn fetch_remote_action(
    cache_dir: &std::path::Path,
    remote: &RemoteAction,
    instance: &str,
) -> Result<PathBuf, ExecutionError> {
    let git_ref = remote.git_ref.clone().ok_or_else(|| {
        ExecutionError::Config(format!(
            "Action {} has no version reference",
            remote.repo_slug()
        ))
    })?;

    let target = cache_dir.join("actions").join(format!(
        "{}-{}-{}",
        remote.org,
        remote.repo,
        sanitize_id(&git_ref)
    ));
    if target.join(".git").exists() {
        return Ok(target);
    }

    std::fs::create_dir_all(&target)?;
    let url = remote.clone_url(instance);
    run_git(&["clone", "--quiet", &url, &target.to_string_lossy()], None)?;
    run_git(&["checkout", "--quiet", &git_ref], Some(&target))?;
    Ok(target)
}

fn run_git(args: &[&str], cwd: Option<&std::path::Path>) -> Result<(), ExecutionError> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .map_err(|e| ExecutionError::Config(format!("Failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(ExecutionError::Config(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn parse_steps_output_ref(value: &str) -> Option<(String, String)> {
    static STEPS_OUTPUT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\$\{\{\s*steps\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\s*\}\}$")
            .unwrap()
    });
    let captures = STEPS_OUTPUT.captures(value.trim())?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

fn sanitize_id(id: &str) -> String {
    static PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new("[^A-Za-z0-9_.-]").unwrap());
    PATTERN.replace_all(id, "-").to_string()
}

fn join_path(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_selection() {
        assert_eq!(
            shell_command("", "/var/run/act/workflow/step-0"),
            vec![
                "bash",
                "--noprofile",
                "--norc",
                "-e",
                "-o",
                "pipefail",
                "/var/run/act/workflow/step-0"
            ]
        );
        assert_eq!(
            shell_command("sh", "/tmp/s"),
            vec!["sh", "-e", "/tmp/s"]
        );
        assert_eq!(
            shell_command("python", "/tmp/s"),
            vec!["python", "/tmp/s"]
        );
        assert_eq!(
            shell_command("perl {0}", "/tmp/s"),
            vec!["perl", "/tmp/s"]
        );
    }

    #[test]
    fn test_parse_steps_output_ref() {
        assert_eq!(
            parse_steps_output_ref("${{ steps.pack.outputs.file }}"),
            Some(("pack".to_string(), "file".to_string()))
        );
        assert_eq!(parse_steps_output_ref("${{ steps.pack.outputs.file }} extended"), None);
        assert_eq!(parse_steps_output_ref("plain"), None);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/work", "sub/dir"), "/work/sub/dir");
        assert_eq!(join_path("/work/", "/sub"), "/work/sub");
        assert_eq!(join_path("/work", ""), "/work");
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("v2"), "v2");
        assert_eq!(sanitize_id("feature/branch name"), "feature-branch-name");
    }
}
