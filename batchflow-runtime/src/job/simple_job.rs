use super::support::{job_support_builders, JobSupport};
use batchflow_core::{
    BatchResult, BatchStatus, Job, JobParametersValidator, JobRepository, SharedJobExecution, Step,
};
use std::sync::Arc;

/// A job that runs its steps one after another and stops at the first step
/// that does not complete.
pub struct SimpleJob {
    support: JobSupport,
    steps: Vec<Arc<dyn Step>>,
}

impl SimpleJob {
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            support: JobSupport::new(name, repository),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    fn run_steps(&self, job_execution: &SharedJobExecution) -> BatchResult<()> {
        let mut last = None;
        for step in &self.steps {
            let step_execution = self.support.step_handler().handle_step(step, job_execution)?;
            let completed = step_execution.status == BatchStatus::Completed;
            last = Some(step_execution);
            if !completed {
                break;
            }
        }

        if let Some(step_execution) = last {
            let mut job = job_execution.lock();
            job.status = step_execution.status;
            job.exit_status = step_execution.exit_status;
        }
        Ok(())
    }
}

job_support_builders!(SimpleJob);

impl Job for SimpleJob {
    fn name(&self) -> &str {
        self.support.name()
    }

    fn is_restartable(&self) -> bool {
        self.support.is_restartable()
    }

    fn parameters_validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        self.support.validator()
    }

    #[tracing::instrument(level = "info", skip(self, job_execution), fields(job = %self.support.name()))]
    fn execute(&self, job_execution: &SharedJobExecution) -> BatchResult<()> {
        self.support
            .execute_with(job_execution, |job_execution| self.run_steps(job_execution))
    }

    fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_string()).collect()
    }

    fn get_step(&self, step_name: &str) -> Option<Arc<dyn Step>> {
        self.steps.iter().find(|step| step.name() == step_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobRepository;
    use crate::step::{ChunkContext, FnTasklet, TaskletStep};
    use crate::repeat::RepeatStatus;
    use batchflow_core::{ExitStatus, JobParameters, SharedStepExecution, StepContribution};
    use parking_lot::Mutex;

    fn step(
        name: &'static str,
        repository: &Arc<InMemoryJobRepository>,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn Step> {
        let log = log.clone();
        let tasklet = FnTasklet::new(move |_: &mut StepContribution, _: &ChunkContext| {
            log.lock().push(name.to_string());
            if fail {
                anyhow::bail!("{name} broke");
            }
            Ok(RepeatStatus::Finished)
        });
        Arc::new(TaskletStep::new(name, Arc::new(tasklet), repository.clone()))
    }

    fn run(job: &SimpleJob, repository: &InMemoryJobRepository) -> SharedJobExecution {
        let params = JobParameters::builder().string("batch", "b-1").build();
        let shared = repository
            .create_job_execution(job.name(), &params)
            .unwrap()
            .into_shared();
        job.execute(&shared).unwrap();
        shared
    }

    #[test]
    fn test_runs_all_steps_in_order() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let job = SimpleJob::new("etl", repository.clone())
            .with_step(step("extract", &repository, &log, false))
            .with_step(step("transform", &repository, &log, false))
            .with_step(step("load", &repository, &log, false));

        let shared = run(&job, &repository);
        assert_eq!(*log.lock(), vec!["extract", "transform", "load"]);
        let execution = shared.lock();
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::COMPLETED);
        assert_eq!(execution.step_executions.len(), 3);
        assert_eq!(job.step_names(), vec!["extract", "transform", "load"]);
        assert!(job.get_step("transform").is_some());
    }

    #[test]
    fn test_stops_at_first_failed_step() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let job = SimpleJob::new("etl", repository.clone())
            .with_step(step("extract", &repository, &log, false))
            .with_step(step("transform", &repository, &log, true))
            .with_step(step("load", &repository, &log, false));

        let shared = run(&job, &repository);
        assert_eq!(*log.lock(), vec!["extract", "transform"]);
        let execution = shared.lock();
        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::FAILED);
        assert!(execution.step_execution("load").is_none());
    }

    /// Step whose outcome cannot be determined.
    struct LostStep;

    impl Step for LostStep {
        fn name(&self) -> &str {
            "lost"
        }

        fn execute(&self, step_execution: &SharedStepExecution) -> BatchResult<()> {
            let mut step_execution = step_execution.lock();
            step_execution.status = BatchStatus::Unknown;
            step_execution.exit_status = ExitStatus::unknown();
            Ok(())
        }
    }

    #[test]
    fn test_job_takes_status_of_last_step_even_when_lower() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let job = SimpleJob::new("etl", repository.clone())
            .with_step(step("extract", &repository, &log, false))
            .with_step(Arc::new(LostStep))
            .with_step(step("load", &repository, &log, false));

        let shared = run(&job, &repository);
        assert_eq!(*log.lock(), vec!["extract"]);
        let execution = shared.lock();
        assert_eq!(execution.status, BatchStatus::Unknown);
        assert_eq!(execution.exit_status.exit_code, ExitStatus::UNKNOWN);
    }

    #[test]
    fn test_job_without_steps_is_noop() {
        let repository = Arc::new(InMemoryJobRepository::new());
        let job = SimpleJob::new("empty", repository.clone());
        let shared = run(&job, &repository);
        assert_eq!(shared.lock().exit_status.exit_code, ExitStatus::NOOP);
    }
}
