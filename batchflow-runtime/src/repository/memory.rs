use super::context_dao::InMemoryExecutionContextDao;
use batchflow_context::ExecutionContext;
use batchflow_core::{
    BatchError, BatchResult, BatchStatus, ExecutionContextDao, JobExecution, JobInstance,
    JobParameters, JobRepository, StepExecution,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Store {
    /// Keyed by job name and identifying parameter key.
    instances: HashMap<(String, String), JobInstance>,
    /// Stored without their step executions; those live in `step_executions`.
    job_executions: BTreeMap<i64, JobExecution>,
    step_executions: BTreeMap<i64, StepExecution>,
    instance_seq: i64,
    job_execution_seq: i64,
    step_execution_seq: i64,
}

impl Store {
    fn instance(&self, job_name: &str, parameters: &JobParameters) -> Option<&JobInstance> {
        self.instances
            .get(&(job_name.to_string(), parameters.identifying_key()))
    }

    fn executions_of(&self, instance: &JobInstance) -> Vec<&JobExecution> {
        self.job_executions
            .values()
            .filter(|execution| execution.job_instance.id == instance.id)
            .collect()
    }

    fn last_execution_of(&self, instance: &JobInstance) -> Option<&JobExecution> {
        self.executions_of(instance)
            .into_iter()
            .max_by_key(|execution| (execution.create_time, execution.id))
    }

    fn steps_of(&self, job_execution_id: i64) -> Vec<StepExecution> {
        self.step_executions
            .values()
            .filter(|step| step.job_execution_id == job_execution_id)
            .cloned()
            .collect()
    }
}

fn snapshot(job_execution: &JobExecution) -> JobExecution {
    let mut stored = job_execution.clone();
    stored.step_executions.clear();
    stored
}

fn not_found(what: &str, id: impl std::fmt::Display) -> BatchError {
    BatchError::Other(anyhow::anyhow!("{what} {id} not found in repository"))
}

/// Job repository holding everything in memory.
///
/// Executions handed out are copies; callers persist changes through the
/// `update_*` methods, which enforce optimistic locking on `version`.
pub struct InMemoryJobRepository {
    store: RwLock<Store>,
    context_dao: Arc<dyn ExecutionContextDao>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::with_context_dao(Arc::new(InMemoryExecutionContextDao::new()))
    }

    pub fn with_context_dao(context_dao: Arc<dyn ExecutionContextDao>) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            context_dao,
        }
    }

    pub fn context_dao(&self) -> &Arc<dyn ExecutionContextDao> {
        &self.context_dao
    }

    pub fn job_instance_count(&self) -> usize {
        self.store.read().instances.len()
    }

    pub fn get_job_instance(&self, job_name: &str, parameters: &JobParameters) -> Option<JobInstance> {
        self.store.read().instance(job_name, parameters).cloned()
    }

    /// A stored job execution with its step executions and contexts attached.
    pub fn get_job_execution(&self, job_execution_id: i64) -> BatchResult<Option<JobExecution>> {
        let (execution, steps) = {
            let store = self.store.read();
            match store.job_executions.get(&job_execution_id) {
                Some(execution) => (execution.clone(), store.steps_of(job_execution_id)),
                None => return Ok(None),
            }
        };
        self.hydrate(execution, steps).map(Some)
    }

    /// Every execution of the instance, oldest first.
    pub fn get_job_executions(&self, job_instance: &JobInstance) -> Vec<JobExecution> {
        let store = self.store.read();
        let mut executions: Vec<JobExecution> = store
            .executions_of(job_instance)
            .into_iter()
            .cloned()
            .collect();
        executions.sort_by_key(|execution| (execution.create_time, execution.id));
        executions
    }

    /// Stored step executions of one job execution, in creation order.
    pub fn get_step_executions(&self, job_execution_id: i64) -> Vec<StepExecution> {
        self.store.read().steps_of(job_execution_id)
    }

    fn hydrate(&self, mut execution: JobExecution, steps: Vec<StepExecution>) -> BatchResult<JobExecution> {
        execution.execution_context = self.context_dao.get_job_execution_context(execution.id)?;
        execution.step_executions = steps
            .into_iter()
            .map(|step| self.with_step_context(step))
            .collect::<BatchResult<_>>()?;
        Ok(execution)
    }

    fn with_step_context(&self, mut step: StepExecution) -> BatchResult<StepExecution> {
        if let Some(id) = step.id {
            step.execution_context = self.context_dao.get_step_execution_context(id)?;
        }
        Ok(step)
    }

    fn check_restartable(job_name: &str, executions: &[&JobExecution]) -> BatchResult<()> {
        for execution in executions {
            if execution.is_running() {
                return Err(BatchError::JobExecutionAlreadyRunning(format!(
                    "job '{job_name}' has a running execution {}",
                    execution.id
                )));
            }
            match execution.status {
                BatchStatus::Unknown => {
                    return Err(BatchError::JobRestart(format!(
                        "execution {} of job '{job_name}' ended in UNKNOWN status; \
                         resolve it manually before restarting",
                        execution.id
                    )))
                }
                BatchStatus::Completed | BatchStatus::Abandoned => {
                    return Err(BatchError::JobInstanceAlreadyComplete(format!(
                        "job '{job_name}' with parameters {} is already {}",
                        execution.job_parameters, execution.status
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRepository for InMemoryJobRepository {
    fn is_job_instance_exists(&self, job_name: &str, parameters: &JobParameters) -> BatchResult<bool> {
        Ok(self.store.read().instance(job_name, parameters).is_some())
    }

    fn create_job_execution(&self, job_name: &str, parameters: &JobParameters) -> BatchResult<JobExecution> {
        let mut store = self.store.write();

        let (instance, previous) = match store.instance(job_name, parameters).cloned() {
            Some(instance) => {
                let executions = store.executions_of(&instance);
                Self::check_restartable(job_name, &executions)?;
                let previous = store.last_execution_of(&instance).map(|execution| execution.id);
                (instance, previous)
            }
            None => {
                store.instance_seq += 1;
                let instance = JobInstance::new(store.instance_seq, job_name, parameters);
                store.instances.insert(
                    (job_name.to_string(), instance.job_key.clone()),
                    instance.clone(),
                );
                tracing::debug!(job = job_name, instance_id = instance.id, "created job instance");
                (instance, None)
            }
        };

        let execution_context = match previous {
            Some(id) => self.context_dao.get_job_execution_context(id)?,
            None => ExecutionContext::new(),
        };

        store.job_execution_seq += 1;
        let mut execution = JobExecution::new(store.job_execution_seq, instance, parameters.clone());
        execution.execution_context = execution_context;
        execution.last_updated = Some(Utc::now());
        store.job_executions.insert(execution.id, snapshot(&execution));
        drop(store);

        self.context_dao.save_job_execution_context(&execution)?;
        tracing::debug!(
            job = job_name,
            job_execution_id = execution.id,
            restart = previous.is_some(),
            "created job execution"
        );
        Ok(execution)
    }

    fn update_job_execution(&self, job_execution: &mut JobExecution) -> BatchResult<()> {
        let mut store = self.store.write();
        let stored = store
            .job_executions
            .get_mut(&job_execution.id)
            .ok_or_else(|| not_found("job execution", job_execution.id))?;
        if stored.version != job_execution.version {
            return Err(BatchError::OptimisticLockingFailure(format!(
                "attempt to update job execution id={} with wrong version ({}), where current version is {}",
                job_execution.id, job_execution.version, stored.version
            )));
        }

        if job_execution.status == BatchStatus::Stopping && job_execution.end_time.is_some() {
            job_execution.upgrade_status(BatchStatus::Stopped);
        }
        job_execution.increment_version();
        job_execution.last_updated = Some(Utc::now());
        *stored = snapshot(job_execution);
        Ok(())
    }

    fn add_step_execution(&self, step_execution: &mut StepExecution) -> BatchResult<()> {
        {
            let mut store = self.store.write();
            if !store.job_executions.contains_key(&step_execution.job_execution_id) {
                return Err(not_found("job execution", step_execution.job_execution_id));
            }
            store.step_execution_seq += 1;
            let id = store.step_execution_seq;
            step_execution.id = Some(id);
            step_execution.version = 0;
            step_execution.last_updated = Some(Utc::now());
            store.step_executions.insert(id, step_execution.clone());
        }
        self.context_dao.save_step_execution_context(step_execution)
    }

    fn update_step_execution(&self, step_execution: &mut StepExecution) -> BatchResult<()> {
        let id = step_execution
            .id
            .ok_or_else(|| not_found("unsaved step execution", &step_execution.step_name))?;

        let mut guard = self.store.write();
        let store = &mut *guard;
        let stored = store
            .step_executions
            .get_mut(&id)
            .ok_or_else(|| not_found("step execution", id))?;
        if stored.version != step_execution.version {
            return Err(BatchError::OptimisticLockingFailure(format!(
                "attempt to update step execution id={id} with wrong version ({}), where current version is {}",
                step_execution.version, stored.version
            )));
        }

        step_execution.increment_version();
        step_execution.last_updated = Some(Utc::now());
        let job_stopping = store
            .job_executions
            .get(&step_execution.job_execution_id)
            .is_some_and(JobExecution::is_stopping);
        if job_stopping {
            step_execution.set_terminate_only();
        }
        *stored = step_execution.clone();
        Ok(())
    }

    fn update_step_execution_context(&self, step_execution: &mut StepExecution) -> BatchResult<()> {
        self.context_dao.update_step_execution_context(step_execution)?;
        step_execution.execution_context.clear_dirty_flag();
        Ok(())
    }

    fn update_job_execution_context(&self, job_execution: &mut JobExecution) -> BatchResult<()> {
        self.context_dao.update_job_execution_context(job_execution)?;
        job_execution.execution_context.clear_dirty_flag();
        Ok(())
    }

    fn get_last_step_execution(
        &self,
        job_instance: &JobInstance,
        step_name: &str,
    ) -> BatchResult<Option<StepExecution>> {
        let last = {
            let store = self.store.read();
            store
                .step_executions
                .values()
                .filter(|step| step.job_instance.id == job_instance.id && step.step_name == step_name)
                .max_by_key(|step| (step.start_time, step.id))
                .cloned()
        };
        last.map(|step| self.with_step_context(step)).transpose()
    }

    fn get_step_execution_count(&self, job_instance: &JobInstance, step_name: &str) -> BatchResult<u32> {
        let store = self.store.read();
        let count = store
            .step_executions
            .values()
            .filter(|step| step.job_instance.id == job_instance.id && step.step_name == step_name)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> BatchResult<Option<JobExecution>> {
        let found = {
            let store = self.store.read();
            store
                .instance(job_name, parameters)
                .and_then(|instance| store.last_execution_of(instance))
                .map(|execution| (execution.clone(), store.steps_of(execution.id)))
        };
        match found {
            Some((execution, steps)) => self.hydrate(execution, steps).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(run: &str) -> JobParameters {
        JobParameters::builder().string("run", run).build()
    }

    fn finish(repository: &InMemoryJobRepository, execution: &mut JobExecution, status: BatchStatus) {
        execution.status = status;
        execution.end_time = Some(Utc::now());
        repository.update_job_execution(execution).unwrap();
    }

    #[test]
    fn test_instance_reused_for_same_parameters() {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("etl", &params("1")).unwrap();
        finish(&repository, &mut first, BatchStatus::Failed);

        let second = repository.create_job_execution("etl", &params("1")).unwrap();
        assert_eq!(first.job_instance, second.job_instance);
        assert_ne!(first.id, second.id);

        let other = repository.create_job_execution("etl", &params("2")).unwrap();
        assert_ne!(other.job_instance.id, first.job_instance.id);
        assert_eq!(repository.job_instance_count(), 2);
        assert!(repository.is_job_instance_exists("etl", &params("2")).unwrap());
    }

    #[test]
    fn test_create_rejects_running_and_complete_instances() {
        let repository = InMemoryJobRepository::new();
        let mut execution = repository.create_job_execution("etl", &params("1")).unwrap();
        execution.status = BatchStatus::Started;
        repository.update_job_execution(&mut execution).unwrap();

        let err = repository.create_job_execution("etl", &params("1")).unwrap_err();
        assert!(matches!(err, BatchError::JobExecutionAlreadyRunning(_)));

        finish(&repository, &mut execution, BatchStatus::Completed);
        let err = repository.create_job_execution("etl", &params("1")).unwrap_err();
        assert!(matches!(err, BatchError::JobInstanceAlreadyComplete(_)));
    }

    #[test]
    fn test_unknown_execution_blocks_restart() {
        let repository = InMemoryJobRepository::new();
        let mut execution = repository.create_job_execution("etl", &params("1")).unwrap();
        finish(&repository, &mut execution, BatchStatus::Unknown);
        let err = repository.create_job_execution("etl", &params("1")).unwrap_err();
        assert!(matches!(err, BatchError::JobRestart(_)));
    }

    #[test]
    fn test_restart_copies_job_context() {
        let repository = InMemoryJobRepository::new();
        let mut execution = repository.create_job_execution("etl", &params("1")).unwrap();
        execution.execution_context.put("offset", 128i64);
        repository.update_job_execution_context(&mut execution).unwrap();
        finish(&repository, &mut execution, BatchStatus::Failed);

        let restarted = repository.create_job_execution("etl", &params("1")).unwrap();
        assert_eq!(restarted.execution_context.get_long("offset"), Some(128));
    }

    #[test]
    fn test_stale_version_is_rejected() {
        let repository = InMemoryJobRepository::new();
        let mut execution = repository.create_job_execution("etl", &params("1")).unwrap();
        let mut stale = execution.clone();
        repository.update_job_execution(&mut execution).unwrap();
        assert_eq!(execution.version, 1);

        let err = repository.update_job_execution(&mut stale).unwrap_err();
        assert!(matches!(err, BatchError::OptimisticLockingFailure(_)));
    }

    #[test]
    fn test_step_update_sees_stopping_job() {
        let repository = InMemoryJobRepository::new();
        let mut job = repository.create_job_execution("etl", &params("1")).unwrap();
        let mut step = job.create_step_execution("load");
        repository.add_step_execution(&mut step).unwrap();
        assert_eq!(step.id, Some(1));

        job.stop();
        repository.update_job_execution(&mut job).unwrap();
        repository.update_step_execution(&mut step).unwrap();
        assert!(step.is_terminate_only());
        assert_eq!(step.version, 1);
    }

    #[test]
    fn test_last_step_execution_and_count() {
        let repository = InMemoryJobRepository::new();
        let mut first = repository.create_job_execution("etl", &params("1")).unwrap();
        let mut step = first.create_step_execution("load");
        step.execution_context.put("line", 10i64);
        repository.add_step_execution(&mut step).unwrap();
        step.status = BatchStatus::Failed;
        repository.update_step_execution(&mut step).unwrap();
        finish(&repository, &mut first, BatchStatus::Failed);

        let mut second = repository.create_job_execution("etl", &params("1")).unwrap();
        let mut retry = second.create_step_execution("load");
        repository.add_step_execution(&mut retry).unwrap();
        assert_eq!((step.id, retry.id), (Some(1), Some(2)));
        assert_eq!(repository.get_step_executions(second.id)[0].id, Some(2));

        let instance = second.job_instance.clone();
        assert_eq!(repository.get_step_execution_count(&instance, "load").unwrap(), 2);
        let last = repository.get_last_step_execution(&instance, "load").unwrap().unwrap();
        assert_eq!(last.id, retry.id);
        assert!(repository.get_last_step_execution(&instance, "other").unwrap().is_none());

        let previous = repository.get_job_execution(first.id).unwrap().unwrap();
        assert_eq!(previous.step_executions.len(), 1);
        assert_eq!(previous.step_executions[0].execution_context.get_long("line"), Some(10));
    }

    #[test]
    fn test_last_job_execution_has_steps() {
        let repository = InMemoryJobRepository::new();
        assert!(repository.get_last_job_execution("etl", &params("1")).unwrap().is_none());

        let mut job = repository.create_job_execution("etl", &params("1")).unwrap();
        let mut step = job.create_step_execution("load");
        repository.add_step_execution(&mut step).unwrap();

        let last = repository.get_last_job_execution("etl", &params("1")).unwrap().unwrap();
        assert_eq!(last.id, job.id);
        assert_eq!(last.step_executions.len(), 1);
        assert_eq!(last.step_executions[0].step_name, "load");
    }
}
