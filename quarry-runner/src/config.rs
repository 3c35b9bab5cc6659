//! Runner configuration
//!
//! Defines all configurable parameters for the runner: which queue backend to
//! serve, how subscriptions are discovered, the flow control applied to each
//! work call, and the command that handles messages.

use anyhow::Context;
use quarry_core::{QueueDesc, QueueType};
use quarry_queue::{BackendOptions, DEFAULT_ACK_DEADLINE, DEFAULT_MAX_EXTENSION, WorkSettings};
use regex::Regex;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this runner instance, stamped on every report
    pub runner_id: String,

    pub queue_type: QueueType,

    /// Project the subscriptions live in
    pub project: String,

    /// Credential reference handed to the backend and to the handler
    pub credentials: String,

    /// Root directory for file queues
    pub queue_root: String,

    pub pubsub_endpoint: String,

    /// Only subscriptions matching this pattern are served
    pub include: Option<String>,

    /// Subscriptions matching this pattern are never served
    pub exclude: Option<String>,

    /// How often subscriptions are rediscovered
    pub refresh_interval: Duration,

    /// Bound on a single work call
    pub work_timeout: Duration,

    /// Maximum unacknowledged messages per subscription
    pub max_jobs: usize,

    pub max_extension: Duration,

    pub ack_deadline: Duration,

    /// Bound on discovery calls
    pub op_timeout: Duration,

    /// Program and arguments run for every message
    pub handler_cmd: Vec<String>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(runner_id: String, queue_type: QueueType, project: String) -> Self {
        Self {
            runner_id,
            queue_type,
            project,
            credentials: String::new(),
            queue_root: String::new(),
            pubsub_endpoint: quarry_queue::pubsub::DEFAULT_ENDPOINT.to_string(),
            include: None,
            exclude: None,
            refresh_interval: Duration::from_secs(30),
            work_timeout: Duration::from_secs(300),
            max_jobs: 1,
            max_extension: DEFAULT_MAX_EXTENSION,
            ack_deadline: DEFAULT_ACK_DEADLINE,
            op_timeout: Duration::from_secs(5),
            handler_cmd: vec!["cat".to_string()],
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - QUEUE_TYPE (optional, pubsub|file|memory, default: pubsub)
    /// - QUEUE_PROJECT (required for pubsub)
    /// - QUEUE_ROOT (required for file)
    /// - RUNNER_ID (optional, default: random)
    /// - QUEUE_CREDENTIALS (optional, path to a bearer token file)
    /// - PUBSUB_ENDPOINT / PUBSUB_EMULATOR_HOST (optional)
    /// - QUEUE_MATCH / QUEUE_MISMATCH (optional, regular expressions)
    /// - REFRESH_INTERVAL, WORK_TIMEOUT, MAX_EXTENSION, ACK_DEADLINE, OP_TIMEOUT (optional, seconds)
    /// - MAX_JOBS (optional, default: 1)
    /// - HANDLER_CMD (optional, program and arguments either whitespace
    ///   separated or as a JSON array of strings when an argument contains spaces)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secs = |key: &str, default: Duration| {
            var(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let queue_type = match var("QUEUE_TYPE") {
            Some(value) => value
                .parse::<QueueType>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid QUEUE_TYPE")?,
            None => QueueType::PubSub,
        };

        let runner_id = var("RUNNER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let project = var("QUEUE_PROJECT").unwrap_or_else(|| "local".to_string());
        let mut config = Self::new(runner_id, queue_type, project);

        config.credentials = var("QUEUE_CREDENTIALS").unwrap_or_default();
        config.queue_root = var("QUEUE_ROOT").unwrap_or_default();
        config.pubsub_endpoint = match (var("PUBSUB_ENDPOINT"), var("PUBSUB_EMULATOR_HOST")) {
            (Some(endpoint), _) => endpoint,
            (None, Some(host)) => format!("http://{}/v1", host),
            (None, None) => config.pubsub_endpoint,
        };
        config.include = var("QUEUE_MATCH");
        config.exclude = var("QUEUE_MISMATCH");

        config.refresh_interval = secs("REFRESH_INTERVAL", config.refresh_interval);
        config.work_timeout = secs("WORK_TIMEOUT", config.work_timeout);
        config.max_extension = secs("MAX_EXTENSION", config.max_extension);
        config.ack_deadline = secs("ACK_DEADLINE", config.ack_deadline);
        config.op_timeout = secs("OP_TIMEOUT", config.op_timeout);
        config.max_jobs = var("MAX_JOBS")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(config.max_jobs);

        if let Some(cmd) = var("HANDLER_CMD") {
            config.handler_cmd = parse_command(&cmd)?;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner_id.is_empty() {
            anyhow::bail!("runner_id cannot be empty");
        }

        if self.project.is_empty() {
            anyhow::bail!("project cannot be empty");
        }

        if self.queue_type == QueueType::File && self.queue_root.is_empty() {
            anyhow::bail!("queue_root is required for file queues");
        }

        if self.refresh_interval.is_zero() {
            anyhow::bail!("refresh_interval must be greater than 0");
        }

        if self.work_timeout.is_zero() {
            anyhow::bail!("work_timeout must be greater than 0");
        }

        if self.max_jobs == 0 {
            anyhow::bail!("max_jobs must be greater than 0");
        }

        if self.ack_deadline.is_zero() {
            anyhow::bail!("ack_deadline must be greater than 0");
        }

        if self.handler_cmd.is_empty() {
            anyhow::bail!("handler_cmd cannot be empty");
        }

        self.matchers()?;
        Ok(())
    }

    /// Compiled include and exclude patterns
    pub fn matchers(&self) -> anyhow::Result<(Option<Regex>, Option<Regex>)> {
        let compile = |pattern: &Option<String>, name: &str| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("Invalid {} pattern", name))
        };
        Ok((
            compile(&self.include, "QUEUE_MATCH")?,
            compile(&self.exclude, "QUEUE_MISMATCH")?,
        ))
    }

    pub fn queue_desc(&self) -> QueueDesc {
        let management = match self.queue_type {
            QueueType::File => self.queue_root.as_str(),
            _ => self.project.as_str(),
        };
        QueueDesc::new(self.project.clone(), management, self.credentials.clone())
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            op_timeout: self.op_timeout,
            pubsub_endpoint: self.pubsub_endpoint.clone(),
            ..BackendOptions::default()
        }
    }

    pub fn work_settings(&self) -> WorkSettings {
        WorkSettings {
            max_extension: self.max_extension,
            ack_deadline: self.ack_deadline,
            ..WorkSettings::new(self.work_timeout, self.max_jobs)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            QueueType::PubSub,
            "local".to_string(),
        )
    }
}

/// Splits a handler command line, accepting a JSON array for arguments with spaces
fn parse_command(cmd: &str) -> anyhow::Result<Vec<String>> {
    let trimmed = cmd.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("HANDLER_CMD is not a JSON array of strings");
    }
    Ok(cmd.split_whitespace().map(str::to_string).collect())
}
