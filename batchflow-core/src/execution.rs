//! Job instances and the execution records of jobs and steps.

use crate::parameters::JobParameters;
use crate::status::{BatchStatus, ExitStatus};
use batchflow_context::{ExecutionContext, ScopedExecution};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A recorded failure. Shared so executions stay cheaply clonable.
pub type Failure = Arc<anyhow::Error>;

pub type SharedJobExecution = Arc<Mutex<JobExecution>>;
pub type SharedStepExecution = Arc<Mutex<StepExecution>>;

/// A logical job run: job name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub job_name: String,
    /// Identifying key of the parameters this instance was created with.
    pub job_key: String,
}

impl JobInstance {
    pub fn new(id: i64, job_name: impl Into<String>, parameters: &JobParameters) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            job_key: parameters.identifying_key(),
        }
    }
}

/// One attempt at running a [`JobInstance`].
#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: i64,
    pub version: u32,
    pub job_instance: JobInstance,
    pub job_parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    pub step_executions: Vec<StepExecution>,
    pub failure_exceptions: Vec<Failure>,
    scope_id: Uuid,
}

impl JobExecution {
    pub fn new(id: i64, job_instance: JobInstance, job_parameters: JobParameters) -> Self {
        Self {
            id,
            version: 0,
            job_instance,
            job_parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failure_exceptions: Vec::new(),
            scope_id: Uuid::new_v4(),
        }
    }

    pub fn into_shared(self) -> SharedJobExecution {
        Arc::new(Mutex::new(self))
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    /// Moves the status forward, never backwards.
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none() && self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    /// Operator stop: flags every step execution for termination and moves
    /// the job to `Stopping`.
    pub fn stop(&mut self) {
        let id = self.id;
        for step in self
            .step_executions
            .iter_mut()
            .filter(|step| step.job_execution_id == id)
        {
            step.set_terminate_only();
        }
        self.status = BatchStatus::Stopping;
    }

    /// Creates a step execution owned by this job execution and returns a
    /// copy sharing its scope id.
    pub fn create_step_execution(&mut self, step_name: impl Into<String>) -> StepExecution {
        let step = StepExecution::new(step_name, self);
        self.step_executions.push(step.clone());
        step
    }

    /// Replaces the step execution with the same scope id, or appends it.
    pub fn add_or_replace_step_execution(&mut self, step_execution: StepExecution) {
        match self
            .step_executions
            .iter_mut()
            .find(|existing| existing.scope_id == step_execution.scope_id)
        {
            Some(existing) => *existing = step_execution,
            None => self.step_executions.push(step_execution),
        }
    }

    /// Step executions started by this job execution, leaving out the ones
    /// carried over from an earlier run because they were skipped.
    pub fn executed_step_executions(&self) -> impl Iterator<Item = &StepExecution> {
        let id = self.id;
        self.step_executions
            .iter()
            .filter(move |step| step.job_execution_id == id)
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|step| step.step_name == step_name)
    }

    pub fn add_failure_exception(&mut self, failure: anyhow::Error) {
        self.failure_exceptions.push(Arc::new(failure));
    }

    /// Failures of the job and of all of its steps.
    pub fn all_failure_exceptions(&self) -> Vec<Failure> {
        let mut all = self.failure_exceptions.clone();
        for step in &self.step_executions {
            all.extend(step.failure_exceptions.iter().cloned());
        }
        all
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
    }
}

impl ScopedExecution for JobExecution {
    fn scope_id(&self) -> Uuid {
        self.scope_id
    }
}

impl fmt::Display for JobExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobExecution: id={}, version={}, job=[{}], status={}, exitStatus={}, parameters={}",
            self.id,
            self.version,
            self.job_name(),
            self.status,
            self.exit_status.exit_code,
            self.job_parameters
        )
    }
}

/// Counts recorded by one chunk, applied to the step execution afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub exit_status: ExitStatus,
}

impl StepContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_read_count(&mut self, count: u64) {
        self.read_count += count;
    }

    pub fn increment_write_count(&mut self, count: u64) {
        self.write_count += count;
    }

    pub fn increment_filter_count(&mut self, count: u64) {
        self.filter_count += count;
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// Execution record of a single step within a job execution.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub id: Option<i64>,
    pub version: u32,
    pub step_name: String,
    pub job_execution_id: i64,
    pub job_instance: JobInstance,
    pub job_parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    pub failure_exceptions: Vec<Failure>,
    pub terminate_only: bool,
    scope_id: Uuid,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution: &JobExecution) -> Self {
        Self {
            id: None,
            version: 0,
            step_name: step_name.into(),
            job_execution_id: job_execution.id,
            job_instance: job_execution.job_instance.clone(),
            job_parameters: job_execution.job_parameters.clone(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            start_time: Utc::now(),
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failure_exceptions: Vec::new(),
            terminate_only: false,
            scope_id: Uuid::new_v4(),
        }
    }

    pub fn into_shared(self) -> SharedStepExecution {
        Arc::new(Mutex::new(self))
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    /// Asks the running step to finish at its next chunk boundary.
    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only
    }

    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.exit_status = self.exit_status.and(&contribution.exit_status);
    }

    pub fn increment_commit_count(&mut self) {
        self.commit_count += 1;
    }

    pub fn increment_rollback_count(&mut self) {
        self.rollback_count += 1;
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn add_failure_exception(&mut self, failure: anyhow::Error) {
        self.failure_exceptions.push(Arc::new(failure));
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "{}, exitStatus={}, readCount={}, filterCount={}, writeCount={}, readSkipCount={}, writeSkipCount={}, processSkipCount={}, commitCount={}, rollbackCount={}",
            self,
            self.exit_status.exit_code,
            self.read_count,
            self.filter_count,
            self.write_count,
            self.read_skip_count,
            self.write_skip_count,
            self.process_skip_count,
            self.commit_count,
            self.rollback_count
        )
    }
}

impl ScopedExecution for StepExecution {
    fn scope_id(&self) -> Uuid {
        self.scope_id
    }
}

impl fmt::Display for StepExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(
                f,
                "StepExecution: id={id}, version={}, name={}, status={}",
                self.version, self.step_name, self.status
            ),
            None => write!(
                f,
                "StepExecution: id=<unsaved>, version={}, name={}, status={}",
                self.version, self.step_name, self.status
            ),
        }
    }
}
