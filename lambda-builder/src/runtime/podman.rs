//! Podman job runtime
//!
//! Handles the build job lifecycle:
//! - Checking podman availability
//! - Starting the builder detached with resource limits and labels
//! - Waiting for the exit status and collecting the digest or log tail
//! - Force-removing jobs on timeout, cancellation and TTL expiry
//!
//! Podman runs rootless, so the builder never holds host root privileges.

use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{JobExit, JobHandle, JobRuntime, JobSpec, RuntimeError};

const LOG_TAIL_LINES: usize = 40;

pub struct PodmanRuntime {
    binary: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that podman is installed and working
    pub async fn check_available(&self) -> Result<(), RuntimeError> {
        let output = self
            .output(&["--version".to_string()])
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("{}. Is podman installed?", e)))?;

        if !output.status.success() {
            return Err(RuntimeError::Unavailable(
                "podman is not working correctly".to_string(),
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Podman is available: {}", version.trim());
        Ok(())
    }

    async fn output(&self, args: &[String]) -> Result<Output, RuntimeError> {
        // A dropped wait (timeout) must not leave the podman client behind
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Command(format!("failed to execute {}: {}", self.binary, e)))
    }

    async fn oom_killed(&self, name: &str) -> Option<bool> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.OOMKilled}}".to_string(),
            name.to_string(),
        ];
        let output = self.output(&args).await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }
}

/// Arguments of the `podman run` call starting a job
pub(crate) fn run_args(spec: &JobSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--security-opt=no-new-privileges".to_string(),
        "--cpus".to_string(),
        spec.resources.cpus.clone(),
        "--memory".to_string(),
        spec.resources.memory.clone(),
        "--memory-reservation".to_string(),
        spec.resources.memory_reservation.clone(),
    ];

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.container);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

fn is_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name or id")
}

#[async_trait]
impl JobRuntime for PodmanRuntime {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, RuntimeError> {
        info!("Starting job {} with image {}", spec.name, spec.image);

        let output = self.output(&run_args(spec)).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(RuntimeError::Refused {
                name: spec.name.clone(),
                message: format!(
                    "exit_code={}, stderr='{}'",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        let id = stdout.trim().to_string();
        info!("Job {} started with ID: {}", spec.name, id);

        Ok(JobHandle {
            name: spec.name.clone(),
            id,
            digest_file: spec.digest_file.clone(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobExit, RuntimeError> {
        let output = self
            .output(&["wait".to_string(), handle.name.clone()])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Ok(JobExit::Vanished);
            }
            return Err(RuntimeError::Command(format!(
                "podman wait {} failed: {}",
                handle.name,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let exit_code: i32 = stdout.trim().parse().map_err(|_| {
            RuntimeError::Command(format!(
                "unexpected podman wait output for {}: '{}'",
                handle.name,
                stdout.trim()
            ))
        })?;

        debug!("Job {} exited with code {}", handle.name, exit_code);

        match exit_code {
            0 => {
                let digest = tokio::fs::read_to_string(&handle.digest_file)
                    .await
                    .ok()
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty());
                Ok(JobExit::Succeeded { digest })
            }
            137 | 143 => match self.oom_killed(&handle.name).await {
                Some(oom) => Ok(JobExit::Killed { exit_code, oom }),
                None => Ok(JobExit::Vanished),
            },
            _ => {
                let log_tail = self
                    .logs(handle, LOG_TAIL_LINES)
                    .await
                    .unwrap_or_else(|e| format!("<logs unavailable: {}>", e));
                Ok(JobExit::Failed {
                    exit_code,
                    log_tail,
                })
            }
        }
    }

    async fn delete(&self, handle: &JobHandle) -> Result<(), RuntimeError> {
        let args = [
            "rm".to_string(),
            "-f".to_string(),
            "-t".to_string(),
            "0".to_string(),
            handle.name.clone(),
        ];
        let output = self.output(&args).await?;

        if output.status.success() {
            debug!("Job {} removed", handle.name);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_container(&stderr) {
            return Ok(());
        }

        warn!("Failed to remove job {}: {}", handle.name, stderr.trim());
        Err(RuntimeError::Command(format!(
            "podman rm {} failed: {}",
            handle.name,
            stderr.trim()
        )))
    }

    async fn logs(&self, handle: &JobHandle, tail: usize) -> Result<String, RuntimeError> {
        let args = [
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            handle.name.clone(),
        ];
        let output = self.output(&args).await?;

        if !output.status.success() {
            return Err(RuntimeError::Command(format!(
                "podman logs {} failed: {}",
                handle.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Kaniko reports progress on stderr
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{JobResources, Mount};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec() -> JobSpec {
        JobSpec {
            name: "lb-1234-1".to_string(),
            image: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            args: vec!["--context=tar:///workspace/context.tar.gz".to_string()],
            env: BTreeMap::from([("JOB_NAME".to_string(), "lb-1234-1".to_string())]),
            resources: JobResources {
                cpus: "1".to_string(),
                memory: "2g".to_string(),
                memory_reservation: "512m".to_string(),
            },
            labels: BTreeMap::from([("lambda.request".to_string(), "evt-1".to_string())]),
            mounts: vec![
                Mount {
                    host: PathBuf::from("/tmp/ws"),
                    container: "/workspace".to_string(),
                    read_only: false,
                },
                Mount {
                    host: PathBuf::from("/etc/auth"),
                    container: "/kaniko/.docker".to_string(),
                    read_only: true,
                },
            ],
            digest_file: PathBuf::from("/tmp/ws/digest"),
        }
    }

    #[test]
    fn test_run_args() {
        let args = run_args(&spec());

        assert_eq!(&args[..4], &["run", "-d", "--name", "lb-1234-1"]);
        assert!(args.contains(&"--security-opt=no-new-privileges".to_string()));
        assert!(args.windows(2).any(|w| w == ["--memory", "2g"]));
        assert!(args.windows(2).any(|w| w == ["--memory-reservation", "512m"]));
        assert!(args.windows(2).any(|w| w == ["--label", "lambda.request=evt-1"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/tmp/ws:/workspace"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/etc/auth:/kaniko/.docker:ro"]));
        assert!(args.windows(2).any(|w| w == ["-e", "JOB_NAME=lb-1234-1"]));

        // Image comes right before the builder arguments
        let n = args.len();
        assert_eq!(args[n - 2], "gcr.io/kaniko-project/executor:v1.23.2");
        assert_eq!(args[n - 1], "--context=tar:///workspace/context.tar.gz");
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container(
            "Error: no container with name or ID \"lb-1\" found: no such container"
        ));
        assert!(!is_missing_container("Error: permission denied"));
    }
}
