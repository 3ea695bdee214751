//! Keel build: produce the container image for a commit and publish it.
//!
//! The real implementation shells out to the docker CLI; every step is bounded
//! by a coarse timeout and any failure aborts the release before planning.

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use keel_core::{ArtifactRef, CoreError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// OCI label recording the source revision.
pub const REVISION_LABEL: &str = "org.opencontainers.image.revision";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid artifact reference: {0}")]
    Artifact(#[from] CoreError),
    #[error("{0} already exists in the registry; tags are never reused")]
    TagExists(String),
    #[error("{step}: could not start {bin}: {source}")]
    Spawn { step: Step, bin: String, #[source] source: std::io::Error },
    #[error("{step} exited with {code:?}: {stderr}")]
    Failed { step: Step, code: Option<i32>, stderr: String },
    #[error("{step} timed out after {after:?}")]
    Timeout { step: Step, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Login,
    Inspect,
    Build,
    Push,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Login => "docker login",
            Step::Inspect => "docker manifest inspect",
            Step::Build => "docker build",
            Step::Push => "docker push",
        })
    }
}

/// Registry login; the password is only ever written to the CLI's stdin.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials").field("username", &self.username).field("password", &"<redacted>").finish()
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory.
    pub context: PathBuf,
    /// Dockerfile; `None` uses `<context>/Dockerfile`.
    pub dockerfile: Option<PathBuf>,
    /// Registry path without tag.
    pub repository: String,
    /// Commit identifier, used verbatim as the tag.
    pub commit: String,
    pub credentials: Option<RegistryCredentials>,
    pub platform: Option<String>,
}

impl BuildRequest {
    pub fn artifact(&self) -> Result<ArtifactRef, BuildError> {
        Ok(ArtifactRef::new(&self.repository, &self.commit)?)
    }
}

/// Produces and publishes an image for a commit.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build_and_push(&self, req: &BuildRequest) -> Result<ArtifactRef, BuildError>;
}

#[async_trait]
impl<B: ArtifactBuilder + ?Sized> ArtifactBuilder for std::sync::Arc<B> {
    async fn build_and_push(&self, req: &BuildRequest) -> Result<ArtifactRef, BuildError> {
        (**self).build_and_push(req).await
    }
}

/// Registry host of a repository path (`docker.io` when none is given).
pub fn registry_host(repository: &str) -> &str {
    match repository.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => first,
        _ => "docker.io",
    }
}

pub fn login_args(host: &str, creds: &RegistryCredentials) -> Vec<String> {
    vec!["login".into(), host.into(), "--username".into(), creds.username.clone(), "--password-stdin".into()]
}

pub fn inspect_args(artifact: &ArtifactRef) -> Vec<String> {
    vec!["manifest".into(), "inspect".into(), artifact.image()]
}

pub fn build_args(req: &BuildRequest, artifact: &ArtifactRef) -> Vec<String> {
    let mut args = vec!["build".to_string(), "--tag".into(), artifact.image()];
    args.push("--label".into());
    args.push(format!("{}={}", REVISION_LABEL, artifact.tag));
    if let Some(df) = &req.dockerfile {
        args.push("--file".into());
        args.push(df.display().to_string());
    }
    if let Some(p) = &req.platform {
        args.push("--platform".into());
        args.push(p.clone());
    }
    args.push(req.context.display().to_string());
    args
}

pub fn push_args(artifact: &ArtifactRef) -> Vec<String> {
    vec!["push".into(), artifact.image()]
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default))
}

/// Builder backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    build_timeout: Duration,
    push_timeout: Duration,
    /// Bound for login and manifest inspection.
    probe_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DockerCli {
    /// `KEEL_DOCKER_BIN`, `KEEL_BUILD_TIMEOUT_SECS` (900), `KEEL_PUSH_TIMEOUT_SECS` (300).
    pub fn from_env() -> Self {
        Self {
            bin: std::env::var("KEEL_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            build_timeout: env_secs("KEEL_BUILD_TIMEOUT_SECS", 900),
            push_timeout: env_secs("KEEL_PUSH_TIMEOUT_SECS", 300),
            probe_timeout: env_secs("KEEL_PROBE_TIMEOUT_SECS", 60),
        }
    }

    pub fn with_timeouts(mut self, build: Duration, push: Duration) -> Self {
        self.build_timeout = build;
        self.push_timeout = push;
        self
    }

    async fn run(&self, step: Step, args: &[String], stdin: Option<&str>, limit: Duration) -> Result<(), BuildError> {
        debug!(%step, args = ?args, "spawning");
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| BuildError::Spawn { step, bin: self.bin.clone(), source: e })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| BuildError::Spawn { step, bin: self.bin.clone(), source: e })?;
            // closing stdin lets the CLI read to EOF
            drop(pipe);
        }
        let out = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(BuildError::Spawn { step, bin: self.bin.clone(), source: e }),
            Err(_) => return Err(BuildError::Timeout { step, after: limit }),
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(BuildError::Failed { step, code: out.status.code(), stderr });
        }
        Ok(())
    }

    async fn publish(&self, req: &BuildRequest, artifact: &ArtifactRef) -> Result<(), BuildError> {
        if let Some(creds) = &req.credentials {
            let host = registry_host(&artifact.repository);
            self.run(Step::Login, &login_args(host, creds), Some(&creds.password), self.probe_timeout).await?;
            info!(registry = %host, user = %creds.username, "registry login ok");
        }
        if self.tag_exists(artifact).await? {
            return Err(BuildError::TagExists(artifact.image()));
        }
        self.run(Step::Build, &build_args(req, artifact), None, self.build_timeout).await?;
        info!(image = %artifact, "image built");
        self.run(Step::Push, &push_args(artifact), None, self.push_timeout).await
    }

    async fn tag_exists(&self, artifact: &ArtifactRef) -> Result<bool, BuildError> {
        match self.run(Step::Inspect, &inspect_args(artifact), None, self.probe_timeout).await {
            Ok(()) => Ok(true),
            Err(BuildError::Failed { stderr, .. }) => {
                debug!(image = %artifact, %stderr, "manifest not found");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ArtifactBuilder for DockerCli {
    async fn build_and_push(&self, req: &BuildRequest) -> Result<ArtifactRef, BuildError> {
        let t0 = Instant::now();
        let artifact = req.artifact()?;
        let res = self.publish(req, &artifact).await;
        histogram!("build_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("build_ok", 1u64);
                info!(image = %artifact, "image pushed");
                Ok(artifact)
            }
            Err(e) => {
                counter!("build_err", 1u64);
                warn!(image = %artifact, error = %e, "build failed");
                Err(e)
            }
        }
    }
}

/// Builder that records requests instead of running docker.
#[derive(Debug, Default)]
pub struct RecordingBuilder {
    requests: Mutex<Vec<BuildRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every build fail at the build step with `stderr`.
    pub fn fail_with(&self, stderr: impl Into<String>) {
        if let Ok(mut g) = self.fail_with.lock() {
            *g = Some(stderr.into());
        }
    }

    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactBuilder for RecordingBuilder {
    async fn build_and_push(&self, req: &BuildRequest) -> Result<ArtifactRef, BuildError> {
        let artifact = req.artifact()?;
        if let Ok(mut g) = self.requests.lock() {
            g.push(req.clone());
        }
        let fail = self.fail_with.lock().ok().and_then(|g| g.clone());
        match fail {
            Some(stderr) => Err(BuildError::Failed { step: Step::Build, code: Some(1), stderr }),
            None => Ok(artifact),
        }
    }
}
