// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker CLI orchestrator.
//!
//! Drives the local engine through the `docker` binary. Every call is one
//! short-lived subprocess, so the adapter holds no engine connection state.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use sysinfo::System;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::config::RegistryCredentials;

/// Configuration for [`DockerCli`].
#[derive(Debug, Clone)]
pub struct DockerCliConfig {
    /// Path or name of the docker binary
    pub binary: String,
    /// Credentials used for `docker login`, if configured
    pub credentials: RegistryCredentials,
}

impl Default for DockerCliConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            credentials: RegistryCredentials::default(),
        }
    }
}

/// Orchestrator backed by the docker CLI.
pub struct DockerCli {
    config: DockerCliConfig,
    system: Mutex<System>,
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc")]
    cpu: String,
}

impl DockerCli {
    /// Create an adapter.
    pub fn new(config: DockerCliConfig) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            config,
            system: Mutex::new(system),
        }
    }

    /// Log into the registry when credentials are configured.
    pub async fn login(&self) -> Result<()> {
        let credentials = &self.config.credentials;
        if !credentials.is_configured() {
            return Ok(());
        }

        let mut child = self
            .command()
            .args(["login", "--username", &credentials.username, "--password-stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(credentials.password.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(failed("login", &output.stderr));
        }
        info!(username = %credentials.username, "Logged into container registry");
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(&self, name: &'static str, args: &[String]) -> Result<String> {
        let output = self.command().args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") || stderr.contains("not found") {
                return Err(OrchestratorError::NotFound(stderr.trim().to_string()));
            }
            return Err(failed(name, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn host_cpu(&self) -> Option<f64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_cpu_usage();
        Some(f64::from(system.global_cpu_usage()))
    }
}

fn failed(command: &str, stderr: &[u8]) -> OrchestratorError {
    OrchestratorError::CommandFailed {
        command: format!("docker {command}"),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').parse().ok()
}

fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--hostname".to_string(),
        spec.hostname.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--cpus".to_string(),
        spec.cpus.to_string(),
        "--memory".to_string(),
        format!("{}m", spec.memory_mb),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.vars {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        args.push("--volume".to_string());
        args.push(format!("{}:{}:rw", mount.host.display(), mount.container));
    }
    if let Some(workdir) = &spec.workdir {
        args.push("--workdir".to_string());
        args.push(workdir.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl Orchestrator for DockerCli {
    fn orchestrator_type(&self) -> &'static str {
        "docker"
    }

    async fn list(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerSummary>> {
        let mut args: Vec<String> = ["ps", "--all", "--no-trunc", "--format", "{{json .}}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (key, value) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }

        let stdout = self.output("ps", &args).await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let ps: PsLine = serde_json::from_str(line)?;
                Ok(ContainerSummary {
                    id: ps.id,
                    name: ps.names,
                    status: ps.status,
                    labels: parse_labels(&ps.labels),
                })
            })
            .collect()
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self
            .output("inspect", &["container".into(), "inspect".into(), name.into()])
            .await
        {
            Ok(_) => Ok(true),
            Err(OrchestratorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String> {
        debug!(name = %spec.name, image = %spec.image, network = %spec.network, "Starting container");
        let stdout = self.output("run", &run_args(spec)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn execute(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let child = self
            .command()
            .arg("exec")
            .arg(name)
            .args(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))??;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            success: output.status.success(),
            output: combined,
        })
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());
        self.output("rm", &args).await.map(|_| ())
    }

    async fn pull(&self, image: &str) -> Result<bool> {
        let status = self
            .command()
            .args(["pull", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        match self
            .output(
                "network inspect",
                &["network".into(), "inspect".into(), name.into()],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(OrchestratorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.output(
            "network create",
            &["network".into(), "create".into(), name.into()],
        )
        .await
        .map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.output("network rm", &["network".into(), "rm".into(), name.into()])
            .await
            .map(|_| ())
    }

    async fn network_connect(&self, container: &str, network: &str) -> Result<()> {
        self.output(
            "network connect",
            &[
                "network".into(),
                "connect".into(),
                network.into(),
                container.into(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn usage(&self) -> Result<UsageReport> {
        let stdout = self
            .output(
                "stats",
                &[
                    "stats".into(),
                    "--no-stream".into(),
                    "--format".into(),
                    "{{json .}}".into(),
                ],
            )
            .await?;

        let mut containers = HashMap::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<StatsLine>(line) {
                Ok(stats) => {
                    if let Some(cpu) = parse_percent(&stats.cpu) {
                        containers.insert(stats.name, cpu);
                    }
                }
                Err(e) => warn!(error = %e, "Skipping unparsable stats line"),
            }
        }

        Ok(UsageReport {
            host: self.host_cpu(),
            containers,
        })
    }

    async fn follow_file(
        &self,
        name: &str,
        path: &str,
        duration: Duration,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let mut child = self
            .command()
            .args(["exec", name, "tail", "-F", path])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("tail stdout not captured"))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(duration);
            tokio::pin!(deadline);
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tx.closed() => break,
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }
}
