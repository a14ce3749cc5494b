pub mod docker;
pub mod host;

pub use docker::{docker_volume_remove_executor, DockerEnvironment};
pub use host::HostEnvironment;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::Executor;
use crate::logging::LineWriter;

/// Environment maps are shared between the run context and the container
/// handle so that `update_from_image_env` and friends can write into the
/// same map the steps read from.
pub type SharedEnv = Arc<Mutex<HashMap<String, String>>>;

pub fn new_shared_env(map: HashMap<String, String>) -> SharedEnv {
    Arc::new(Mutex::new(map))
}

/// The sink container output is streamed into, line by line.
pub type LogSink = Arc<Mutex<LineWriter>>;

/// A file to be materialised inside the execution environment.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub mode: u32,
    pub body: String,
}

/// Everything needed to create a job container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub image: String,
    pub username: String,
    pub password: String,
    pub name: String,
    pub env: Vec<String>,
    pub mounts: HashMap<String, String>,
    pub binds: Vec<String>,
    pub network_mode: String,
    pub privileged: bool,
    pub userns_mode: String,
    pub platform: String,
    pub hostname: String,
}

/// An isolated execution environment for one job. Every operation is
/// deferred: it returns an [`Executor`] that the job pipeline composes and
/// later drives. The host-backed variant answers `is_host() == true`, which
/// teardown uses to skip the container-volume removal.
pub trait ContainerEnvironment: Send + Sync {
    fn pull(&self, force_pull: bool) -> Executor;
    fn create(&self, cap_add: Vec<String>, cap_drop: Vec<String>) -> Executor;
    fn start(&self, attach: bool) -> Executor;
    fn exec(
        &self,
        cmd: Vec<String>,
        cmdline: String,
        env: HashMap<String, String>,
        user: String,
        workdir: String,
    ) -> Executor;
    fn copy(&self, dest_dir: String, files: Vec<FileEntry>) -> Executor;
    fn copy_dir(&self, dest_dir: String, src_dir: String, use_git_ignore: bool) -> Executor;
    fn update_from_image_env(&self, env: SharedEnv) -> Executor;
    fn update_from_env(&self, path: String, env: SharedEnv) -> Executor;
    fn remove(&self) -> Executor;
    fn close(&self) -> Executor;

    fn is_host(&self) -> bool {
        false
    }

    /// The backend identifier of the running container, when there is one.
    fn id(&self) -> Option<String> {
        None
    }
}

/// Merge `KEY=VALUE` lines into a shared environment map, splitting on the
/// first `=` only.
pub(crate) fn apply_env_lines<'a>(lines: impl Iterator<Item = &'a str>, env: &SharedEnv) {
    if let Ok(mut env) = env.lock() {
        for line in lines {
            if let Some(idx) = line.find('=') {
                if idx > 0 {
                    env.insert(line[..idx].to_string(), line[idx + 1..].to_string());
                }
            }
        }
    }
}

/// Recursively collect the files under `src_dir` as (relative, absolute)
/// pairs. `.git` is always skipped; with `use_git_ignore` the patterns from
/// a top-level `.gitignore` are honoured (name, prefix and `*.ext` forms).
pub(crate) fn collect_files(
    src_dir: &Path,
    use_git_ignore: bool,
) -> std::io::Result<Vec<(PathBuf, PathBuf)>> {
    let ignore_patterns = if use_git_ignore {
        read_ignore_patterns(src_dir)
    } else {
        Vec::new()
    };

    let mut files = Vec::new();
    collect_files_inner(src_dir, Path::new(""), &ignore_patterns, &mut files)?;
    Ok(files)
}

fn collect_files_inner(
    dir: &Path,
    rel: &Path,
    ignore_patterns: &[String],
    files: &mut Vec<(PathBuf, PathBuf)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name == ".git" {
            continue;
        }

        let rel_path = rel.join(name.as_ref());
        if is_ignored(&rel_path, ignore_patterns) {
            continue;
        }

        if path.is_dir() {
            collect_files_inner(&path, &rel_path, ignore_patterns, files)?;
        } else if path.is_file() {
            files.push((rel_path, path));
        }
    }
    Ok(())
}

fn read_ignore_patterns(src_dir: &Path) -> Vec<String> {
    match std::fs::read_to_string(src_dir.join(".gitignore")) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.trim_start_matches('/').trim_end_matches('/').to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn is_ignored(rel_path: &Path, patterns: &[String]) -> bool {
    let rel = rel_path.to_string_lossy();
    for pattern in patterns {
        if let Some(suffix) = pattern.strip_prefix('*') {
            if rel.ends_with(suffix) {
                return true;
            }
        } else if rel == *pattern
            || rel.starts_with(&format!("{}/", pattern))
            || rel_path
                .file_name()
                .map(|n| n.to_string_lossy() == *pattern)
                .unwrap_or(false)
        {
            return true;
        }
    }
    false
}
