//! Docker engine backend
//!
//! Lifecycle operations shell out to the `docker` CLI with a per-command
//! timeout. Stats are read from the engine API over its Unix socket with a
//! hyper HTTP/1.1 client, because the CLI only reports pre-computed
//! percentages.

use super::stats::{parse_stats, ContainerStats};
use super::{
    Availability, BuildOutput, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    RuntimeError, DETECTOR_LABEL,
};
use crate::config::RuntimeConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of build output kept in error messages
const BUILD_LOG_TAIL_LINES: usize = 40;

/// Docker CLI adapter
pub struct DockerCli {
    binary: String,
    socket: PathBuf,
    command_timeout: Duration,
    build_timeout: Duration,
    availability: Availability,
}

impl DockerCli {
    /// Probe the engine once and cache the result
    ///
    /// Never fails: an unreachable engine yields an adapter whose every
    /// operation returns [`RuntimeError::Unavailable`].
    pub async fn detect(config: &RuntimeConfig) -> Self {
        let mut cli = Self {
            binary: config.docker_binary.clone(),
            socket: config.engine_socket.clone(),
            command_timeout: config.command_timeout(),
            build_timeout: config.build_timeout(),
            availability: Availability::Unavailable {
                reason: "not probed".to_string(),
            },
        };

        cli.availability = match cli
            .exec(&["version", "--format", "{{.Server.Version}}"], cli.command_timeout)
            .await
        {
            Ok(output) => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(version = %version, "Container engine available");
                Availability::Available { version }
            }
            Err(e) => {
                warn!(error = %e, "Container engine unavailable; detector subsystem degraded");
                Availability::Unavailable {
                    reason: e.to_string(),
                }
            }
        };
        cli
    }

    /// Run one CLI command; non-zero exit becomes `CommandFailed`
    async fn exec(&self, args: &[&str], timeout: Duration) -> Result<Output, RuntimeError> {
        let output = self.exec_unchecked(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_missing_object(&stderr) {
                return Err(RuntimeError::NotFound(stderr));
            }
            Err(RuntimeError::CommandFailed(format!(
                "docker {}: {}",
                args.first().copied().unwrap_or_default(),
                stderr
            )))
        }
    }

    async fn exec_unchecked(&self, args: &[&str], timeout: Duration) -> Result<Output, RuntimeError> {
        debug!(args = ?args, "docker");
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(RuntimeError::Unavailable(
                format!("'{}' not found in PATH", self.binary),
            )),
            Ok(Err(e)) => Err(RuntimeError::Io(e)),
            Err(_) => Err(RuntimeError::Timeout {
                command: format!("docker {}", args.first().copied().unwrap_or_default()),
                waited: timeout,
            }),
        }
    }

    /// One-shot stats document from the engine API
    #[cfg(unix)]
    async fn fetch_stats_document(&self, container_id: &str) -> Result<Vec<u8>, RuntimeError> {
        use http_body_util::{BodyExt, Empty};
        use hyper::body::Bytes;
        use hyper::Request;
        use hyper_util::rt::TokioIo;
        use tokio::net::UnixStream;

        let uri = format!("/containers/{}/stats?stream=false", container_id);
        let exchange = async {
            let stream = UnixStream::connect(&self.socket).await?;
            let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(engine_api_error)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "Engine API connection closed");
                }
            });

            let request = Request::get(uri.as_str())
                .header(hyper::header::HOST, "docker")
                .body(Empty::<Bytes>::new())
                .map_err(|e| RuntimeError::CommandFailed(format!("stats request: {}", e)))?;
            let response = sender.send_request(request).await.map_err(engine_api_error)?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(engine_api_error)?
                .to_bytes();
            Ok::<_, RuntimeError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.command_timeout, exchange)
            .await
            .map_err(|_| RuntimeError::Timeout {
                command: "stats".to_string(),
                waited: self.command_timeout,
            })??;

        check_stats_status(status, container_id)?;
        Ok(body.to_vec())
    }

    #[cfg(not(unix))]
    async fn fetch_stats_document(&self, _container_id: &str) -> Result<Vec<u8>, RuntimeError> {
        Err(RuntimeError::CommandFailed(
            "engine stats require a Unix socket".to_string(),
        ))
    }
}

fn engine_api_error(err: hyper::Error) -> RuntimeError {
    RuntimeError::CommandFailed(format!("engine API: {}", err))
}

fn check_stats_status(status: hyper::StatusCode, container_id: &str) -> Result<(), RuntimeError> {
    match status {
        hyper::StatusCode::OK => Ok(()),
        hyper::StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(format!("container {}", container_id))),
        other => Err(RuntimeError::CommandFailed(format!(
            "engine stats returned HTTP {}",
            other.as_u16()
        ))),
    }
}

fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such image") || lower.contains("no such object")
}

fn tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn availability(&self) -> Availability {
        self.availability.clone()
    }

    async fn build_image(&self, context_dir: &Path, image_ref: &str) -> Result<BuildOutput, RuntimeError> {
        self.ensure_available()?;
        let context = context_dir.to_string_lossy();
        let output = self
            .exec_unchecked(
                &["build", "--pull", "--rm", "--force-rm", "--tag", image_ref, &context],
                self.build_timeout,
            )
            .await?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(RuntimeError::BuildFailed {
                image: image_ref.to_string(),
                message: format!("docker build exited with {}", output.status),
                log: tail(&log, BUILD_LOG_TAIL_LINES),
            });
        }

        info!(image = %image_ref, "Image built");
        Ok(BuildOutput {
            image_ref: image_ref.to_string(),
            log,
        })
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool, RuntimeError> {
        self.ensure_available()?;
        match self
            .exec(&["image", "inspect", "--format", "{{.Id}}", image_ref], self.command_timeout)
            .await
        {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.ensure_available()?;
        let mut args: Vec<String> = vec!["run".to_string()];
        args.extend(spec.run_args());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.exec(&arg_refs, self.command_timeout).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::CommandFailed(
                "docker run returned no container id".to_string(),
            ));
        }

        info!(
            detector = %spec.detector_name,
            container = %id,
            image = %spec.image_ref,
            "Container started"
        );
        Ok(ContainerHandle {
            id,
            name: spec.container_name.clone(),
            image_ref: spec.image_ref.clone(),
        })
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        self.ensure_available()?;
        let output = self
            .exec(
                &[
                    "inspect",
                    "--type",
                    "container",
                    "--format",
                    "{{.State.Running}} {{.State.ExitCode}} {{.State.Status}}",
                    &handle.id,
                ],
                self.command_timeout,
            )
            .await?;

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let running = parts.next() == Some("true");
        let exit_code = parts.next().and_then(|c| c.parse().ok());
        let status = parts.next().unwrap_or("unknown").to_string();
        Ok(ContainerState {
            running,
            exit_code,
            status,
        })
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<ContainerStats, RuntimeError> {
        self.ensure_available()?;
        let body = self.fetch_stats_document(&handle.id).await?;
        parse_stats(&body).map_err(|e| RuntimeError::CommandFailed(format!("bad stats document: {}", e)))
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        let secs = timeout.as_secs().max(1).to_string();
        // Engine waits `secs` before SIGKILL; allow the command a little longer
        let wait = timeout + self.command_timeout;
        match self.exec(&["stop", "--time", &secs, &handle.id], wait).await {
            Ok(_) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        match self
            .exec(&["rm", "--force", "--volumes", &handle.id], self.command_timeout)
            .await
        {
            Ok(_) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_detector_containers(&self, detector_name: &str) -> Result<usize, RuntimeError> {
        self.ensure_available()?;
        let filter = format!("label={}={}", DETECTOR_LABEL, detector_name);
        let output = self
            .exec(&["ps", "--all", "--quiet", "--filter", &filter], self.command_timeout)
            .await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        for id in &ids {
            match self.exec(&["rm", "--force", id], self.command_timeout).await {
                Ok(_) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ids.len())
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        self.ensure_available()?;
        match self.exec(&["rmi", "--force", image_ref], self.command_timeout).await {
            Ok(_) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        self.ensure_available()?;
        let output = self
            .exec(
                &["images", "--format", "{{.Repository}}:{{.Tag}}", repository],
                self.command_timeout,
            )
            .await?;
        let refs: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with(":<none>"))
            .map(str::to_string)
            .collect();

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for image in refs {
            match self.exec(&["rmi", "--force", &image], self.command_timeout).await {
                Ok(_) | Err(RuntimeError::NotFound(_)) => removed.push(image),
                Err(e) => failures.push(format!("{}: {}", image, e)),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(RuntimeError::CommandFailed(failures.join("; ")))
        }
    }
}
