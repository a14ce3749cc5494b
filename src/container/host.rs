use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::common::{ExecutionError, Executor};
use crate::container::{
    apply_env_lines, collect_files, ContainerEnvironment, FileEntry, LogSink, SharedEnv,
};
use crate::logging;

/// Degenerate execution environment that runs steps directly on the host
/// filesystem. Used for `-self-hosted` jobs; there is no container, so
/// pull/create/start are no-ops and `remove` runs the cleanup closure that
/// deletes the per-run scratch tree.
pub struct HostEnvironment {
    path: PathBuf,
    cleanup: Arc<dyn Fn() + Send + Sync>,
    log: LogSink,
}

impl HostEnvironment {
    pub fn new(
        path: PathBuf,
        cleanup: impl Fn() + Send + Sync + 'static,
        log: LogSink,
    ) -> Self {
        HostEnvironment {
            path,
            cleanup: Arc::new(cleanup),
            log,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl ContainerEnvironment for HostEnvironment {
    fn pull(&self, _force_pull: bool) -> Executor {
        Executor::ok()
    }

    fn create(&self, _cap_add: Vec<String>, _cap_drop: Vec<String>) -> Executor {
        Executor::ok()
    }

    fn start(&self, _attach: bool) -> Executor {
        Executor::ok()
    }

    fn exec(
        &self,
        cmd: Vec<String>,
        _cmdline: String,
        env: HashMap<String, String>,
        _user: String,
        workdir: String,
    ) -> Executor {
        let base = self.path.clone();
        let log = self.log.clone();

        Executor::from_fn(move |_ctx| {
            let base = base.clone();
            let log = log.clone();
            let cmd = cmd.clone();
            let env = env.clone();
            let workdir = workdir.clone();
            async move {
                let program = cmd.first().ok_or_else(|| {
                    ExecutionError::Container("Empty command for host execution".to_string())
                })?;

                let cwd = if workdir.is_empty() {
                    base.clone()
                } else {
                    let path = PathBuf::from(&workdir);
                    if path.is_absolute() {
                        path
                    } else {
                        base.join(path)
                    }
                };

                let output = tokio::process::Command::new(program)
                    .args(&cmd[1..])
                    .envs(&env)
                    .current_dir(&cwd)
                    .output()
                    .await
                    .map_err(|e| {
                        ExecutionError::Container(format!("Failed to spawn '{}': {}", program, e))
                    })?;

                if let Ok(mut writer) = log.lock() {
                    writer.write(&String::from_utf8_lossy(&output.stdout));
                    writer.write(&String::from_utf8_lossy(&output.stderr));
                    writer.flush();
                }

                if output.status.success() {
                    Ok(())
                } else {
                    Err(ExecutionError::Container(format!(
                        "Command exited with code {}",
                        output.status.code().unwrap_or(-1)
                    )))
                }
            }
        })
    }

    fn copy(&self, dest_dir: String, files: Vec<FileEntry>) -> Executor {
        Executor::from_fn(move |_ctx| {
            let dest_dir = dest_dir.clone();
            let files = files.clone();
            async move {
                for file in &files {
                    let target = PathBuf::from(&dest_dir).join(&file.name);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&target, &file.body)?;
                    set_mode(&target, file.mode)?;
                }
                Ok(())
            }
        })
    }

    fn copy_dir(&self, dest_dir: String, src_dir: String, use_git_ignore: bool) -> Executor {
        Executor::from_fn(move |ctx| {
            let dest_dir = dest_dir.clone();
            let src_dir = src_dir.clone();
            async move {
                let files = collect_files(std::path::Path::new(&src_dir), use_git_ignore)?;
                ctx.log_debug(&format!(
                    "Copying workspace {} -> {} ({} files)",
                    src_dir,
                    dest_dir,
                    files.len()
                ));
                for (rel, abs) in files {
                    let target = PathBuf::from(&dest_dir).join(rel);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(abs, target)?;
                }
                Ok(())
            }
        })
    }

    fn update_from_image_env(&self, _env: SharedEnv) -> Executor {
        Executor::ok()
    }

    fn update_from_env(&self, path: String, env: SharedEnv) -> Executor {
        Executor::from_fn(move |_ctx| {
            let path = path.clone();
            let env = env.clone();
            async move {
                match std::fs::read_to_string(&path) {
                    Ok(content) => apply_env_lines(content.lines(), &env),
                    Err(e) => logging::debug(&format!("Could not read {}: {}", path, e)),
                }
                Ok(())
            }
        })
    }

    fn remove(&self) -> Executor {
        let cleanup = self.cleanup.clone();
        Executor::from_fn(move |ctx| {
            let cleanup = cleanup.clone();
            async move {
                cleanup();
                ctx.log_debug("Removed host executor scratch directory");
                Ok(())
            }
        })
    }

    fn close(&self) -> Executor {
        let log = self.log.clone();
        Executor::from_fn(move |_ctx| {
            let log = log.clone();
            async move {
                if let Ok(mut writer) = log.lock() {
                    writer.flush();
                }
                Ok(())
            }
        })
    }

    fn is_host(&self) -> bool {
        true
    }
}

#[cfg(unix)]
fn set_mode(path: &PathBuf, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &PathBuf, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
