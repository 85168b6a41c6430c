//! Deployed stack state
//!
//! [SnapshotReader] performs the one remote read of a synthesis run. Throttling and transient failures are
//! retried here with bounded exponential backoff; a stack that does not exist is `Ok(None)` because a first
//! deployment is the normal case, not an error.
//!
//! There is no ambient session. Credentials profile and region travel in a [SessionContext] with every call.
use crate::document::Pairs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Explicit context for remote calls
#[derive(Debug, Clone, Default, PartialEq, Eq, derive_new::new)]
pub struct SessionContext {
    pub profile: Option<String>,
    pub region: Option<String>,
}

/// Stack as described by the remote service
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackDescription {
    pub stack_name: String,
    #[serde(default)]
    pub stack_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<StackParameter>,
    #[serde(default)]
    pub tags: Vec<StackTag>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackParameter {
    pub parameter_key: String,
    #[serde(default)]
    pub parameter_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackTag {
    pub key: String,
    pub value: String,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("request throttled")]
    Throttled,
    #[error("transient failure")]
    Transient(#[source] BoxError),
    #[error("request failed")]
    Fatal(#[source] BoxError),
}

impl QueryError {
    fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Throttled | QueryError::Transient(_))
    }
}

/// Remote stack query
pub trait StackQuery {
    /// `Ok(None)` when the stack does not exist
    fn describe_stack(
        &self,
        session: &SessionContext,
        stack_name: &str,
    ) -> Result<Option<StackDescription>, QueryError>;
}

/// Normalized deployed state, comparable to an environment section
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackSnapshot {
    pub stack_name: String,
    pub parameters: Pairs,
    pub tags: Pairs,
    pub template_ref: Option<String>,
    pub capabilities: Vec<String>,
    pub region: Option<String>,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    ///
    /// Never exceeds `max_backoff`, however large the attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

mod millis {
    use serde::Deserialize;
    use std::time::Duration;

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub struct SnapshotReader<'q> {
    query: &'q dyn StackQuery,
    retry: RetryPolicy,
    template_tag: String,
    sleep: Box<dyn Fn(Duration) + 'q>,
}

impl<'q> SnapshotReader<'q> {
    /// `template_tag` is the tag key carrying the template locator
    pub fn new(query: &'q dyn StackQuery, retry: RetryPolicy, template_tag: impl Into<String>) -> Self {
        Self {
            query,
            retry,
            template_tag: template_tag.into(),
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep between attempts
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'q) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    /// Read the deployed state of a stack
    ///
    /// `fallback_template` is used when the stack carries no template tag.
    #[tracing::instrument(level = "info", skip(self, session, fallback_template))]
    pub fn fetch(
        &self,
        session: &SessionContext,
        stack_name: &str,
        fallback_template: Option<&str>,
    ) -> Result<Option<StackSnapshot>, SnapshotError> {
        let mut attempt = 0;
        let description = loop {
            attempt += 1;
            match self.query.describe_stack(session, stack_name) {
                Ok(description) => break description,
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "stack query failed, retrying");
                    (self.sleep)(delay);
                }
                Err(err) if err.is_retryable() => {
                    return Err(SnapshotError::RemoteUnavailable {
                        stack: stack_name.to_string(),
                        attempts: attempt,
                        source: err,
                    })
                }
                Err(err) => {
                    return Err(SnapshotError::Query {
                        stack: stack_name.to_string(),
                        source: err,
                    })
                }
            }
        };

        let Some(description) = description else {
            tracing::info!("stack not found");
            return Ok(None);
        };

        Ok(Some(self.normalize(description, fallback_template)))
    }

    fn normalize(&self, description: StackDescription, fallback_template: Option<&str>) -> StackSnapshot {
        let parameters: Pairs = description
            .parameters
            .into_iter()
            .filter_map(|p| Some((p.parameter_key, p.parameter_value?)))
            .collect();
        let tags: Pairs = description
            .tags
            .into_iter()
            .map(|tag| (tag.key, tag.value))
            .collect();

        let template_ref = tags
            .get(&self.template_tag)
            .cloned()
            .or_else(|| fallback_template.map(str::to_string));

        let region = description
            .stack_id
            .as_deref()
            .and_then(|arn| arn.split(':').nth(3))
            .filter(|region| !region.is_empty())
            .map(str::to_string);

        StackSnapshot {
            stack_name: description.stack_name,
            parameters,
            tags,
            template_ref,
            capabilities: description.capabilities,
            region,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("stack {stack} could not be read after {attempts} attempts")]
    RemoteUnavailable {
        stack: String,
        attempts: u32,
        #[source]
        source: QueryError,
    },
    #[error("stack {stack} could not be read")]
    Query {
        stack: String,
        #[source]
        source: QueryError,
    },
}

/// Stack descriptions saved from a describe-stacks call
///
/// ```json
/// {"Stacks": [{"StackName": "acme-widget-test-pipeline", "Parameters": [..], "Tags": [..]}]}
/// ```
#[derive(Debug, Clone)]
pub struct DescribeStacksFile {
    path: PathBuf,
}

impl DescribeStacksFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    #[serde(default)]
    stacks: Vec<StackDescription>,
}

impl StackQuery for DescribeStacksFile {
    fn describe_stack(
        &self,
        _session: &SessionContext,
        stack_name: &str,
    ) -> Result<Option<StackDescription>, QueryError> {
        tracing::debug!(path=%self.path.display(), "reading stack descriptions");
        let contents =
            std::fs::read_to_string(&self.path).map_err(|err| QueryError::Fatal(err.into()))?;
        let output: DescribeStacksOutput =
            serde_json::from_str(&contents).map_err(|err| QueryError::Fatal(err.into()))?;

        Ok(output
            .stacks
            .into_iter()
            .find(|stack| stack.stack_name == stack_name))
    }
}
