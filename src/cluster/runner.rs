use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::cluster::JobSpec;
use crate::config::SandboxConfig;

/// Starts the process behind a job on the local machine.
///
/// The returned child has stdout and stderr piped, and stdin piped only when
/// the job asked for it.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn spawn(&self, job: &JobSpec) -> io::Result<Child>;

    /// Stop a running job. The default kills the child directly.
    async fn stop(&self, _job: &JobSpec, child: &mut Child) -> io::Result<()> {
        child.kill().await
    }
}

fn stdio_for(job: &JobSpec, command: &mut Command) {
    command
        .stdin(if job.config.attach_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Runs the job's command as a plain child process, ignoring the image.
///
/// Meant for development and tests where Docker is not available.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl JobRunner for ProcessRunner {
    async fn spawn(&self, job: &JobSpec) -> io::Result<Child> {
        let (program, args) = job.config.cmd.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "job has no command to run")
        })?;

        let mut command = Command::new(program);
        command.args(args);
        for pair in &job.config.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        stdio_for(job, &mut command);

        tracing::info!(job_id = %job.id, program = %program, "Spawning job process");
        command.spawn()
    }
}

/// Runs jobs in Docker containers with security isolation.
///
/// Containers get:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct DockerRunner {
    config: SandboxConfig,
}

impl DockerRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn container_name(job: &JobSpec) -> String {
        format!("jobgate-{}", job.id)
    }

    /// Arguments passed to `docker` for the given job.
    pub fn run_args(&self, job: &JobSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", Self::container_name(job)),
        ];

        if job.config.attach_stdin {
            args.push("--interactive".to_string());
        }
        if job.config.tty {
            args.push("--tty".to_string());
        }

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        for pair in &job.config.env {
            args.push("--env".to_string());
            args.push(pair.clone());
        }

        args.push(job.config.image.to_string());
        args.extend(job.config.cmd.iter().cloned());
        args
    }
}

#[async_trait]
impl JobRunner for DockerRunner {
    async fn spawn(&self, job: &JobSpec) -> io::Result<Child> {
        let args = self.run_args(job);
        tracing::info!(job_id = %job.id, image = %job.config.image, "Starting job container");

        let mut command = Command::new("docker");
        command.args(&args);
        stdio_for(job, &mut command);
        command.spawn()
    }

    async fn stop(&self, job: &JobSpec, child: &mut Child) -> io::Result<()> {
        // Killing the CLI alone leaves the container running.
        let status = Command::new("docker")
            .args(["rm", "--force", &Self::container_name(job)])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            tracing::warn!(job_id = %job.id, status = %status, "docker rm failed");
        }
        child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ImageRef;
    use crate::cluster::ContainerConfig;

    fn job(cmd: &[&str]) -> JobSpec {
        JobSpec {
            id: "abc123".into(),
            app_id: "app".into(),
            release_id: "rel".into(),
            job_type: String::new(),
            tags: Default::default(),
            config: ContainerConfig {
                image: ImageRef {
                    name: "alpine".into(),
                    tag: Some("3".into()),
                    id: None,
                },
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                env: vec!["A=1".into()],
                attach_stdout: true,
                attach_stderr: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn docker_args_apply_sandbox() {
        let runner = DockerRunner::new(SandboxConfig::default());
        let args = runner.run_args(&job(&["echo", "hi"]));

        assert_eq!(&args[..3], ["run", "--rm", "--name=jobgate-abc123"]);
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=256m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(!args.contains(&"--interactive".to_string()));
        assert!(!args.contains(&"--tty".to_string()));
        assert!(args.ends_with(&[
            "--env".to_string(),
            "A=1".to_string(),
            "alpine:3".to_string(),
            "echo".to_string(),
            "hi".to_string(),
        ]));
    }

    #[test]
    fn docker_args_for_interactive_tty() {
        let runner = DockerRunner::new(SandboxConfig {
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
        });
        let mut spec = job(&[]);
        spec.config.attach_stdin = true;
        spec.config.tty = true;
        let args = runner.run_args(&spec);

        assert!(args.contains(&"--interactive".to_string()));
        assert!(args.contains(&"--tty".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--network")));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert_eq!(args.last().map(String::as_str), Some("alpine:3"));
    }

    #[tokio::test]
    async fn process_runner_requires_command() {
        let err = ProcessRunner.spawn(&job(&[])).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn process_runner_passes_env() {
        let child = ProcessRunner
            .spawn(&job(&["sh", "-c", "printf %s \"$A\""]))
            .await
            .unwrap();
        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"1");
    }
}
