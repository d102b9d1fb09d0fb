//! Runner abstraction
//!
//! A runner executes one transform job and returns an output descriptor or
//! a typed failure, never a partial success. Native-process, sidecar, and
//! per-job-container runners are interchangeable implementations of the
//! one trait; the scheduler is agnostic to which is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::checksum::ContentHash;
use crate::error::RunnerError;
use crate::media::MediaType;
use crate::representation::{PayloadSource, ToolVersion};
use crate::transform::{SourceRef, ToolImage, TransformRequest};

/// Resource ceilings enforced by the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_wall_time_secs: u64,
    pub max_output_bytes: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self { max_wall_time_secs: 30, max_output_bytes: 64 * 1024 * 1024 }
    }
}

/// The job document handed to a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub sources: Vec<SourceRef>,
    pub operation: String,
    pub options: serde_json::Value,
    pub output_media_type: MediaType,
    pub limits: RunLimits,
}

impl JobSpec {
    pub fn from_request(request: &TransformRequest, max_output_bytes: u64) -> Self {
        Self {
            sources: request.sources.clone(),
            operation: request.operation.clone(),
            options: request.options.clone(),
            output_media_type: request.output.clone(),
            limits: RunLimits {
                max_wall_time_secs: request.timeout_secs,
                max_output_bytes,
            },
        }
    }
}

/// A runner's success report. Provenance fields are optional here so a
/// misbehaving tool can be detected: the scheduler rejects outputs missing
/// `content_hash` or `tool_version` as contract violations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerOutput {
    pub media_type: MediaType,
    pub payload: PayloadSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<ToolVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Executes one transform job
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, spec: &JobSpec) -> Result<RunnerOutput, RunnerError>;
}

/// An operation binding: the runner instance plus the tool image identity
/// that participates in the transform key.
#[derive(Clone)]
pub struct RunnerBinding {
    pub runner: Arc<dyn Runner>,
    pub tool_image: ToolImage,
}

/// Maps operation names to runner bindings. The composer validates
/// transform rules against this catalog; the scheduler dispatches through
/// it.
#[derive(Default, Clone)]
pub struct RunnerCatalog {
    bindings: BTreeMap<String, RunnerBinding>,
}

impl RunnerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        operation: impl Into<String>,
        tool_image: ToolImage,
        runner: Arc<dyn Runner>,
    ) {
        self.bindings
            .insert(operation.into(), RunnerBinding { runner, tool_image });
    }

    pub fn binding(&self, operation: &str) -> Option<&RunnerBinding> {
        self.bindings.get(operation)
    }

    /// Operation names the composer accepts in transform rules
    pub fn operation_names(&self) -> BTreeSet<String> {
        self.bindings.keys().cloned().collect()
    }
}

/// Native-process runner: spawns a configured command, writes the job spec
/// as JSON on stdin, and reads a `RunnerOutput` JSON document from stdout.
/// Wall-time and output-size limits are enforced here.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

#[async_trait]
impl Runner for CommandRunner {
    async fn run(&self, spec: &JobSpec) -> Result<RunnerOutput, RunnerError> {
        let spec_json = serde_json::to_vec(spec)
            .map_err(|e| RunnerError::InputRejected(format!("unserializable job spec: {}", e)))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::ToolFailure(format!("spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&spec_json)
                .await
                .map_err(|e| RunnerError::ToolFailure(format!("write job spec: {}", e)))?;
            drop(stdin);
        }

        let wall = Duration::from_secs(spec.limits.max_wall_time_secs);
        let output = match tokio::time::timeout(wall, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RunnerError::ToolFailure(format!("wait: {}", e))),
            Err(_) => {
                debug!(program = %self.program, "runner exceeded wall time, killed");
                return Err(RunnerError::Timeout);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::ToolFailure(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let out_len = output.stdout.len() as u64;
        if out_len > spec.limits.max_output_bytes {
            return Err(RunnerError::TooLarge {
                limit: spec.limits.max_output_bytes,
                actual: out_len,
            });
        }

        let report: RunnerOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| RunnerError::ToolFailure(format!("unparseable runner output: {}", e)))?;

        if let PayloadSource::Inline { data } = &report.payload {
            let inline_len = data.len() as u64;
            if inline_len > spec.limits.max_output_bytes {
                return Err(RunnerError::TooLarge {
                    limit: spec.limits.max_output_bytes,
                    actual: inline_len,
                });
            }
        }

        Ok(report)
    }
}
