use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use futures_util::StreamExt;

use crate::common::{ExecutionError, Executor};
use crate::container::{
    apply_env_lines, collect_files, ContainerEnvironment, ContainerSpec, FileEntry, LogSink,
    SharedEnv,
};
use crate::logging;

/// A job container backed by the local Docker daemon.
pub struct DockerEnvironment {
    docker: Docker,
    spec: ContainerSpec,
    state: Arc<Mutex<Option<String>>>,
    log: LogSink,
}

impl DockerEnvironment {
    pub fn new(spec: ContainerSpec, log: LogSink) -> Result<Self, ExecutionError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ExecutionError::Container(format!("Failed to connect to Docker: {}", e))
        })?;

        Ok(DockerEnvironment {
            docker,
            spec,
            state: Arc::new(Mutex::new(None)),
            log,
        })
    }

    fn container_id(&self) -> Result<String, ExecutionError> {
        self.state
            .lock()
            .ok()
            .and_then(|id| id.clone())
            .ok_or_else(|| ExecutionError::Container("Container has not been created".to_string()))
    }

    fn credentials(&self) -> Option<DockerCredentials> {
        if self.spec.username.is_empty() && self.spec.password.is_empty() {
            return None;
        }
        Some(DockerCredentials {
            username: Some(self.spec.username.clone()),
            password: Some(self.spec.password.clone()),
            ..Default::default()
        })
    }

    fn write_log(log: &LogSink, chunk: &str) {
        if let Ok(mut writer) = log.lock() {
            writer.write(chunk);
        }
    }
}

impl ContainerEnvironment for DockerEnvironment {
    fn pull(&self, force_pull: bool) -> Executor {
        let docker = self.docker.clone();
        let image = self.spec.image.clone();
        let credentials = self.credentials();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let image = image.clone();
            let credentials = credentials.clone();
            async move {
                if !force_pull && docker.inspect_image(&image).await.is_ok() {
                    ctx.log_debug(&format!("Image {} already present", image));
                    return Ok(());
                }

                ctx.log_info(&format!("Pulling image {}", image));
                let options = CreateImageOptions {
                    from_image: image.clone(),
                    ..Default::default()
                };

                let mut stream = docker.create_image(Some(options), None, credentials);
                while let Some(result) = stream.next().await {
                    result.map_err(|e| {
                        ExecutionError::Container(format!("Failed to pull {}: {}", image, e))
                    })?;
                }
                Ok(())
            }
        })
    }

    fn create(&self, cap_add: Vec<String>, cap_drop: Vec<String>) -> Executor {
        let docker = self.docker.clone();
        let spec = self.spec.clone();
        let state = self.state.clone();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let spec = spec.clone();
            let state = state.clone();
            let cap_add = cap_add.clone();
            let cap_drop = cap_drop.clone();
            async move {
                let mounts: Vec<Mount> = spec
                    .mounts
                    .iter()
                    .map(|(source, target)| Mount {
                        source: Some(source.clone()),
                        target: Some(target.clone()),
                        typ: Some(MountTypeEnum::VOLUME),
                        ..Default::default()
                    })
                    .collect();

                let host_config = HostConfig {
                    binds: Some(spec.binds.clone()),
                    mounts: Some(mounts),
                    network_mode: Some(spec.network_mode.clone()),
                    privileged: Some(spec.privileged),
                    userns_mode: if spec.userns_mode.is_empty() {
                        None
                    } else {
                        Some(spec.userns_mode.clone())
                    },
                    cap_add: if cap_add.is_empty() { None } else { Some(cap_add) },
                    cap_drop: if cap_drop.is_empty() { None } else { Some(cap_drop) },
                    ..Default::default()
                };

                let config = Config {
                    image: Some(spec.image.clone()),
                    entrypoint: if spec.entrypoint.is_empty() {
                        None
                    } else {
                        Some(spec.entrypoint.clone())
                    },
                    cmd: if spec.cmd.is_empty() {
                        None
                    } else {
                        Some(spec.cmd.clone())
                    },
                    env: Some(spec.env.clone()),
                    working_dir: Some(spec.working_dir.clone()),
                    hostname: if spec.hostname.is_empty() {
                        None
                    } else {
                        Some(spec.hostname.clone())
                    },
                    host_config: Some(host_config),
                    ..Default::default()
                };

                let options = CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: if spec.platform.is_empty() {
                        None
                    } else {
                        Some(spec.platform.clone())
                    },
                };

                let response = docker
                    .create_container(Some(options), config)
                    .await
                    .map_err(|e| {
                        ExecutionError::Container(format!("Failed to create container: {}", e))
                    })?;

                ctx.log_debug(&format!("Created container {}", response.id));
                if let Ok(mut id) = state.lock() {
                    *id = Some(response.id);
                }
                Ok(())
            }
        })
    }

    fn start(&self, _attach: bool) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let state = state.clone();
            async move {
                let id = state
                    .lock()
                    .ok()
                    .and_then(|id| id.clone())
                    .ok_or_else(|| {
                        ExecutionError::Container("Container has not been created".to_string())
                    })?;

                docker
                    .start_container::<String>(&id, None)
                    .await
                    .map_err(|e| {
                        ExecutionError::Container(format!("Failed to start container: {}", e))
                    })?;
                ctx.log_debug(&format!("Started container {}", id));
                Ok(())
            }
        })
    }

    fn exec(
        &self,
        cmd: Vec<String>,
        _cmdline: String,
        env: HashMap<String, String>,
        user: String,
        workdir: String,
    ) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();
        let log = self.log.clone();
        let default_workdir = self.spec.working_dir.clone();

        Executor::from_fn(move |_ctx| {
            let docker = docker.clone();
            let state = state.clone();
            let log = log.clone();
            let cmd = cmd.clone();
            let env = env.clone();
            let user = user.clone();
            let workdir = if workdir.is_empty() {
                default_workdir.clone()
            } else {
                workdir.clone()
            };
            async move {
                let id = state
                    .lock()
                    .ok()
                    .and_then(|id| id.clone())
                    .ok_or_else(|| {
                        ExecutionError::Container("Container has not been created".to_string())
                    })?;

                let env_list: Vec<String> =
                    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

                let options = CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env_list),
                    user: if user.is_empty() { None } else { Some(user) },
                    working_dir: Some(workdir),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                };

                let exec = docker.create_exec(&id, options).await.map_err(|e| {
                    ExecutionError::Container(format!("Failed to create exec: {}", e))
                })?;

                let started = docker.start_exec(&exec.id, None).await.map_err(|e| {
                    ExecutionError::Container(format!("Failed to start exec: {}", e))
                })?;

                if let StartExecResults::Attached { mut output, .. } = started {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(log_output) => {
                                Self::write_log(
                                    &log,
                                    &String::from_utf8_lossy(&log_output.into_bytes()),
                                );
                            }
                            Err(e) => {
                                logging::warning(&format!("Error reading exec output: {}", e));
                                break;
                            }
                        }
                    }
                }
                if let Ok(mut writer) = log.lock() {
                    writer.flush();
                }

                let inspect = docker.inspect_exec(&exec.id).await.map_err(|e| {
                    ExecutionError::Container(format!("Failed to inspect exec: {}", e))
                })?;

                match inspect.exit_code {
                    Some(0) | None => Ok(()),
                    Some(code) => Err(ExecutionError::Container(format!(
                        "Command exited with code {}",
                        code
                    ))),
                }
            }
        })
    }

    fn copy(&self, dest_dir: String, files: Vec<FileEntry>) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let state = state.clone();
            let dest_dir = dest_dir.clone();
            let files = files.clone();
            async move {
                let id = state
                    .lock()
                    .ok()
                    .and_then(|id| id.clone())
                    .ok_or_else(|| {
                        ExecutionError::Container("Container has not been created".to_string())
                    })?;

                let mut builder = tar::Builder::new(Vec::new());
                for file in &files {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(file.body.len() as u64);
                    header.set_mode(file.mode);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, &file.name, file.body.as_bytes())
                        .map_err(|e| {
                            ExecutionError::Container(format!("Failed to build archive: {}", e))
                        })?;
                }
                let archive = builder.into_inner().map_err(|e| {
                    ExecutionError::Container(format!("Failed to finish archive: {}", e))
                })?;

                ctx.log_debug(&format!(
                    "Copying {} file(s) into {}",
                    files.len(),
                    dest_dir
                ));
                let options = UploadToContainerOptions {
                    path: dest_dir.clone(),
                    ..Default::default()
                };
                docker
                    .upload_to_container(&id, Some(options), archive.into())
                    .await
                    .map_err(|e| {
                        ExecutionError::Container(format!("Failed to copy into container: {}", e))
                    })?;
                Ok(())
            }
        })
    }

    fn copy_dir(&self, dest_dir: String, src_dir: String, use_git_ignore: bool) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let state = state.clone();
            let dest_dir = dest_dir.clone();
            let src_dir = src_dir.clone();
            async move {
                let id = state
                    .lock()
                    .ok()
                    .and_then(|id| id.clone())
                    .ok_or_else(|| {
                        ExecutionError::Container("Container has not been created".to_string())
                    })?;

                let src = std::path::Path::new(&src_dir);
                let files = collect_files(src, use_git_ignore)?;

                let mut builder = tar::Builder::new(Vec::new());
                for (rel, abs) in &files {
                    let mut file = std::fs::File::open(abs)?;
                    builder.append_file(rel, &mut file).map_err(|e| {
                        ExecutionError::Container(format!("Failed to archive workspace: {}", e))
                    })?;
                }
                let archive = builder.into_inner().map_err(|e| {
                    ExecutionError::Container(format!("Failed to finish archive: {}", e))
                })?;

                ctx.log_info(&format!(
                    "Copying workspace {} -> {} ({} files)",
                    src_dir,
                    dest_dir,
                    files.len()
                ));
                let options = UploadToContainerOptions {
                    path: dest_dir.clone(),
                    ..Default::default()
                };
                docker
                    .upload_to_container(&id, Some(options), archive.into())
                    .await
                    .map_err(|e| {
                        ExecutionError::Container(format!("Failed to copy workspace: {}", e))
                    })?;
                Ok(())
            }
        })
    }

    fn update_from_image_env(&self, env: SharedEnv) -> Executor {
        let docker = self.docker.clone();
        let image = self.spec.image.clone();

        Executor::from_fn(move |_ctx| {
            let docker = docker.clone();
            let image = image.clone();
            let env = env.clone();
            async move {
                let inspect = docker.inspect_image(&image).await.map_err(|e| {
                    ExecutionError::Container(format!("Failed to inspect image: {}", e))
                })?;

                if let Some(image_env) = inspect.config.and_then(|c| c.env) {
                    apply_env_lines(image_env.iter().map(String::as_str), &env);
                }
                Ok(())
            }
        })
    }

    fn update_from_env(&self, path: String, env: SharedEnv) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();

        Executor::from_fn(move |_ctx| {
            let docker = docker.clone();
            let state = state.clone();
            let path = path.clone();
            let env = env.clone();
            async move {
                let id = state
                    .lock()
                    .ok()
                    .and_then(|id| id.clone())
                    .ok_or_else(|| {
                        ExecutionError::Container("Container has not been created".to_string())
                    })?;

                let options = DownloadFromContainerOptions { path: path.clone() };
                let mut stream = docker.download_from_container(&id, Some(options));
                let mut bytes = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(data) => bytes.extend_from_slice(&data),
                        Err(e) => {
                            // a missing env file is not an error
                            logging::debug(&format!("Could not read {}: {}", path, e));
                            return Ok(());
                        }
                    }
                }

                let mut archive = tar::Archive::new(&bytes[..]);
                if let Ok(entries) = archive.entries() {
                    for entry in entries.flatten() {
                        let mut content = String::new();
                        let mut entry = entry;
                        if entry.read_to_string(&mut content).is_ok() {
                            apply_env_lines(content.lines(), &env);
                        }
                    }
                }
                Ok(())
            }
        })
    }

    fn remove(&self) -> Executor {
        let docker = self.docker.clone();
        let state = self.state.clone();
        let name = self.spec.name.clone();

        Executor::from_fn(move |ctx| {
            let docker = docker.clone();
            let state = state.clone();
            let name = name.clone();
            async move {
                let options = RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                };

                let id = state.lock().ok().and_then(|mut id| id.take());
                match id {
                    Some(id) => {
                        if let Err(e) = docker.remove_container(&id, Some(options)).await {
                            logging::warning(&format!(
                                "Failed to remove container {}: {}",
                                id, e
                            ));
                        } else {
                            ctx.log_debug(&format!("Removed container {}", id));
                        }
                    }
                    None => {
                        // clear a stale same-name container from an earlier run
                        if docker.remove_container(&name, Some(options)).await.is_ok() {
                            ctx.log_debug(&format!("Removed stale container {}", name));
                        }
                    }
                }
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

    fn id(&self) -> Option<String> {
        self.state.lock().ok().and_then(|id| id.clone())
    }
}

/// Removes a named Docker volume. Teardown failures are logged, never
/// propagated.
pub fn docker_volume_remove_executor(volume_name: String, force: bool) -> Executor {
    Executor::from_fn(move |ctx| {
        let volume_name = volume_name.clone();
        async move {
            let docker = match Docker::connect_with_local_defaults() {
                Ok(docker) => docker,
                Err(e) => {
                    logging::warning(&format!(
                        "Cannot connect to Docker to remove volume {}: {}",
                        volume_name, e
                    ));
                    return Ok(());
                }
            };

            let options = RemoveVolumeOptions { force };
            match docker.remove_volume(&volume_name, Some(options)).await {
                Ok(()) => ctx.log_debug(&format!("Removed volume {}", volume_name)),
                Err(e) => {
                    logging::debug(&format!("Could not remove volume {}: {}", volume_name, e))
                }
            }
            Ok(())
        }
    })
}
