//! # batchflow Logger
//!
//! Logging and tracing support for batchflow jobs

use batchflow_core::{BatchStatus, JobExecution};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Logging section of the batch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set, e.g. `info` or
    /// `batchflow_runtime=debug`.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Logger for batch jobs
pub struct Logger {
    pub trace_id: String,
}

impl Logger {
    /// Create a new logger
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create a logger with a specific trace ID
    pub fn with_trace_id(trace_id: String) -> Self {
        Self { trace_id }
    }

    /// Initialize tracing subscriber
    pub fn init_tracing() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    /// Initialize tracing from configuration. `RUST_LOG` still wins over
    /// the configured level. Fails if a global subscriber is already set.
    pub fn init_from_config(config: &LoggingConfig) -> anyhow::Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .map_err(|e| anyhow::anyhow!("invalid log level '{}': {e}", config.level))?;
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = if config.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        info!(trace_id = %self.trace_id, "{}", message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        warn!(trace_id = %self.trace_id, "{}", message);
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        error!(trace_id = %self.trace_id, "{}", message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        debug!(trace_id = %self.trace_id, "{}", message);
    }

    /// Log a one-line summary of a finished job execution
    pub fn log_job_summary(&self, execution: &JobExecution) {
        let summary = JobSummary::of(execution);
        let duration_ms = match (execution.start_time, execution.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };

        info!(
            trace_id = %self.trace_id,
            job_name = %execution.job_name(),
            job_execution_id = execution.id,
            status = %execution.status,
            exit_code = %execution.exit_status.exit_code,
            total_steps = summary.total,
            completed = summary.completed,
            failed = summary.failed,
            stopped = summary.stopped,
            duration_ms,
            "Job execution summary"
        );

        for failure in &execution.failure_exceptions {
            error!(trace_id = %self.trace_id, "Job failure: {:#}", failure);
        }
    }

    /// Log each step execution of a job execution
    pub fn log_step_details(&self, execution: &JobExecution) {
        for step in &execution.step_executions {
            let duration_ms = step
                .end_time
                .map(|end| (end - step.start_time).num_milliseconds())
                .unwrap_or_default();

            match step.status {
                BatchStatus::Completed => {
                    info!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        duration_ms,
                        read_count = step.read_count,
                        write_count = step.write_count,
                        commit_count = step.commit_count,
                        "Step completed successfully"
                    );
                }
                BatchStatus::Failed => {
                    let message = step
                        .failure_exceptions
                        .first()
                        .map(|e| format!("{e:#}"))
                        .unwrap_or_else(|| step.exit_status.exit_description.clone());
                    error!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        duration_ms,
                        rollback_count = step.rollback_count,
                        error = %message,
                        "Step failed"
                    );
                }
                BatchStatus::Stopped | BatchStatus::Stopping => {
                    warn!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        duration_ms,
                        "Step stopped"
                    );
                }
                BatchStatus::Abandoned => {
                    warn!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        "Step abandoned"
                    );
                }
                BatchStatus::Starting | BatchStatus::Started => {
                    warn!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        "Step still running"
                    );
                }
                BatchStatus::Unknown => {
                    error!(
                        trace_id = %self.trace_id,
                        step_name = %step.step_name,
                        "Step finished in unknown state"
                    );
                }
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// Step counts of a job execution, by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl JobSummary {
    pub fn of(execution: &JobExecution) -> Self {
        let count = |status: BatchStatus| {
            execution
                .step_executions
                .iter()
                .filter(|step| step.status == status)
                .count()
        };
        Self {
            total: execution.step_executions.len(),
            completed: count(BatchStatus::Completed),
            failed: count(BatchStatus::Failed),
            stopped: count(BatchStatus::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{JobInstance, JobParameters};

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_yaml::from_str("json: true").unwrap();
        assert_eq!(config.level, "info");
        assert!(config.json);
    }

    #[test]
    fn test_job_summary_counts_steps() {
        let params = JobParameters::new();
        let mut job = JobExecution::new(1, JobInstance::new(1, "report", &params), params);
        for (name, status) in [
            ("a", BatchStatus::Completed),
            ("b", BatchStatus::Failed),
            ("c", BatchStatus::Completed),
        ] {
            let mut step = job.create_step_execution(name);
            step.status = status;
            job.add_or_replace_step_execution(step);
        }

        let summary = JobSummary::of(&job);
        assert_eq!(
            summary,
            JobSummary {
                total: 3,
                completed: 2,
                failed: 1,
                stopped: 0
            }
        );

        let logger = Logger::with_trace_id("t-1".to_string());
        logger.log_job_summary(&job);
        logger.log_step_details(&job);
    }
}
