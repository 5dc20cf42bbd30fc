use super::support::{job_support_builders, JobSupport};
use crate::step::StepHandler;
use batchflow_context::BATCH_RESTART;
use batchflow_core::{
    BatchError, BatchResult, BatchStatus, ExitStatus, Flow, FlowExecution, FlowExecutionStatus,
    FlowExecutor, Job, JobParametersValidator, JobRepository, SharedJobExecution, Step,
    StepExecution, StateKind,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Carries out a flow on behalf of a job execution.
///
/// The last step execution is tracked per thread so the branches of a split
/// each see their own.
pub struct JobFlowExecutor {
    repository: Arc<dyn JobRepository>,
    step_handler: Arc<dyn StepHandler>,
    job_execution: SharedJobExecution,
    exit_status: Mutex<ExitStatus>,
    step_executions: DashMap<ThreadId, StepExecution>,
}

impl JobFlowExecutor {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        step_handler: Arc<dyn StepHandler>,
        job_execution: SharedJobExecution,
    ) -> Self {
        Self {
            repository,
            step_handler,
            job_execution,
            exit_status: Mutex::new(ExitStatus::executing()),
            step_executions: DashMap::new(),
        }
    }

    fn is_step_restart(&self, step: &dyn Step) -> BatchResult<bool> {
        let instance = self.job_execution.lock().job_instance.clone();
        Ok(self.repository.get_step_execution_count(&instance, step.name())? > 0)
    }
}

impl FlowExecutor for JobFlowExecutor {
    fn execute_step(&self, step: &Arc<dyn Step>) -> BatchResult<String> {
        let is_rerun = self.is_step_restart(step.as_ref())?;
        let mut step_execution = self.step_handler.handle_step(step, &self.job_execution)?;
        if is_rerun {
            step_execution.execution_context.put(BATCH_RESTART, true);
        }
        self.step_executions
            .insert(thread::current().id(), step_execution.clone());

        if step_execution.is_terminate_only() {
            return Err(BatchError::interrupted(
                format!("step '{}' requested termination", step_execution.step_name),
                step_execution.status,
            ));
        }
        Ok(step_execution.exit_status.exit_code)
    }

    fn job_execution(&self) -> SharedJobExecution {
        self.job_execution.clone()
    }

    fn step_execution(&self) -> Option<StepExecution> {
        self.step_executions
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
    }

    fn close(&self, _result: &FlowExecution) {
        self.step_executions.remove(&thread::current().id());
    }

    fn abandon_step_execution(&self) -> BatchResult<()> {
        let Some(mut last) = self.step_execution() else {
            return Ok(());
        };
        if !matches!(last.status, BatchStatus::Stopped | BatchStatus::Failed) {
            return Ok(());
        }

        tracing::info!(step = %last.step_name, status = %last.status, "abandoning step execution");
        last.status = BatchStatus::Abandoned;
        self.repository.update_step_execution(&mut last)?;

        {
            let mut job = self.job_execution.lock();
            if job.id == last.job_execution_id {
                job.add_or_replace_step_execution(last.clone());
            }
        }
        self.step_executions.insert(thread::current().id(), last);
        Ok(())
    }

    fn update_job_execution_status(&self, status: &FlowExecutionStatus) {
        let mut exit_status = self.exit_status.lock();
        *exit_status = exit_status.and(&ExitStatus::new(status.name.clone()));

        let mut job = self.job_execution.lock();
        job.status = BatchStatus::match_status(&status.name);
        job.exit_status = exit_status.clone();
    }

    fn is_restart(&self) -> bool {
        if self
            .step_execution()
            .is_some_and(|last| last.status == BatchStatus::Abandoned)
        {
            // the last step was abandoned by a stop-and-restart end state
            return true;
        }
        self.job_execution
            .lock()
            .executed_step_executions()
            .next()
            .is_none()
    }

    fn add_exit_status(&self, code: &str) {
        let mut exit_status = self.exit_status.lock();
        *exit_status = exit_status.and(&ExitStatus::new(code));
    }
}

/// A job whose steps are wired together by a [`Flow`].
pub struct FlowJob {
    support: JobSupport,
    flow: Arc<dyn Flow>,
}

impl FlowJob {
    pub fn new(
        name: impl Into<String>,
        flow: Arc<dyn Flow>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            support: JobSupport::new(name, repository),
            flow,
        }
    }

    pub fn flow(&self) -> &Arc<dyn Flow> {
        &self.flow
    }

    fn run_flow(&self, job_execution: &SharedJobExecution) -> BatchResult<()> {
        let executor = Arc::new(JobFlowExecutor::new(
            self.support.repository().clone(),
            self.support.step_handler().clone(),
            job_execution.clone(),
        ));
        let flow_executor: Arc<dyn FlowExecutor> = executor.clone();

        match self.flow.start(&flow_executor) {
            Ok(execution) => {
                tracing::debug!(job = %self.support.name(), state = %execution.name, status = %execution.status, "flow finished");
                executor.update_job_execution_status(&execution.status);
                Ok(())
            }
            Err(e @ BatchError::Other(_)) => Err(BatchError::FlowExecution(format!(
                "flow execution ended unexpectedly: {:#}",
                e.into_anyhow()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Steps of the flow, descending into nested flows and splits.
    fn collect_steps(flow: &dyn Flow, steps: &mut Vec<Arc<dyn Step>>) {
        for state_name in flow.state_names() {
            let Some(state) = flow.get_state(&state_name) else {
                continue;
            };
            match &state.kind {
                StateKind::Step(step) => {
                    if !steps.iter().any(|known| known.name() == step.name()) {
                        steps.push(step.clone());
                    }
                }
                _ => {
                    for nested in state.flows() {
                        Self::collect_steps(nested.as_ref(), steps);
                    }
                }
            }
        }
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        let mut steps = Vec::new();
        Self::collect_steps(self.flow.as_ref(), &mut steps);
        steps
    }
}

job_support_builders!(FlowJob);

impl Job for FlowJob {
    fn name(&self) -> &str {
        self.support.name()
    }

    fn is_restartable(&self) -> bool {
        self.support.is_restartable()
    }

    fn parameters_validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        self.support.validator()
    }

    #[tracing::instrument(level = "info", skip(self, job_execution), fields(job = %self.support.name(), flow = %self.flow.name()))]
    fn execute(&self, job_execution: &SharedJobExecution) -> BatchResult<()> {
        self.support
            .execute_with(job_execution, |job_execution| self.run_flow(job_execution))
    }

    fn step_names(&self) -> Vec<String> {
        self.steps().iter().map(|step| step.name().to_string()).collect()
    }

    fn get_step(&self, step_name: &str) -> Option<Arc<dyn Step>> {
        self.steps().into_iter().find(|step| step.name() == step_name)
    }
}
