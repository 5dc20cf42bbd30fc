use super::executor::{FlowExecutor, JobExecutionDecider};
use super::status::{FlowExecution, FlowExecutionAggregator, FlowExecutionStatus};
use super::Flow;
use crate::error::{BatchError, BatchResult};
use crate::status::BatchStatus;
use crate::step::Step;
use crate::task_executor::TaskExecutor;
use crossbeam::channel;
use std::fmt;
use std::sync::Arc;

/// What a state does when the flow reaches it.
#[derive(Clone)]
pub enum StateKind {
    Step(Arc<dyn Step>),
    Flow(Arc<dyn Flow>),
    Split {
        flows: Vec<Arc<dyn Flow>>,
        task_executor: Arc<dyn TaskExecutor>,
        aggregator: Arc<dyn FlowExecutionAggregator>,
    },
    Decision(Arc<dyn JobExecutionDecider>),
    End {
        status: FlowExecutionStatus,
        code: String,
        abandon: bool,
    },
}

/// A named node of the flow graph.
#[derive(Clone)]
pub struct State {
    pub name: String,
    pub kind: StateKind,
}

impl State {
    pub fn step(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::Step(step),
        }
    }

    pub fn flow(name: impl Into<String>, flow: Arc<dyn Flow>) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::Flow(flow),
        }
    }

    pub fn split(
        name: impl Into<String>,
        flows: Vec<Arc<dyn Flow>>,
        task_executor: Arc<dyn TaskExecutor>,
        aggregator: Arc<dyn FlowExecutionAggregator>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::Split {
                flows,
                task_executor,
                aggregator,
            },
        }
    }

    pub fn decision(name: impl Into<String>, decider: Arc<dyn JobExecutionDecider>) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::Decision(decider),
        }
    }

    pub fn end(
        name: impl Into<String>,
        status: FlowExecutionStatus,
        code: impl Into<String>,
        abandon: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::End {
                status,
                code: code.into(),
                abandon,
            },
        }
    }

    pub fn is_end_state(&self) -> bool {
        matches!(self.kind, StateKind::End { .. })
    }

    /// The flows run by this state, if any.
    pub fn flows(&self) -> Vec<Arc<dyn Flow>> {
        match &self.kind {
            StateKind::Flow(flow) => vec![flow.clone()],
            StateKind::Split { flows, .. } => flows.clone(),
            _ => Vec::new(),
        }
    }

    pub fn handle(&self, executor: &Arc<dyn FlowExecutor>) -> BatchResult<FlowExecutionStatus> {
        match &self.kind {
            StateKind::Step(step) => {
                executor.abandon_step_execution()?;
                Ok(FlowExecutionStatus::new(executor.execute_step(step)?))
            }
            StateKind::Flow(flow) => Ok(flow.start(executor)?.status),
            StateKind::Split {
                flows,
                task_executor,
                aggregator,
            } => self.handle_split(flows, task_executor.as_ref(), aggregator.as_ref(), executor),
            StateKind::Decision(decider) => {
                let step_execution = executor.step_execution();
                let job_execution = executor.job_execution();
                let job = job_execution.lock();
                Ok(decider.decide(&job, step_execution.as_ref()))
            }
            StateKind::End {
                status,
                code,
                abandon,
            } => handle_end(status, code, *abandon, executor),
        }
    }

    fn handle_split(
        &self,
        flows: &[Arc<dyn Flow>],
        task_executor: &dyn TaskExecutor,
        aggregator: &dyn FlowExecutionAggregator,
        executor: &Arc<dyn FlowExecutor>,
    ) -> BatchResult<FlowExecutionStatus> {
        let (tx, rx) = channel::unbounded::<BatchResult<FlowExecution>>();
        let mut dispatched = 0;
        let mut rejected = None;
        for flow in flows {
            let flow = flow.clone();
            let executor = executor.clone();
            let tx = tx.clone();
            let task = Box::new(move || {
                let result = flow.start(&executor);
                if tx.send(result).is_err() {
                    tracing::warn!(flow = flow.name(), "split result dropped, no one is waiting for it");
                }
            });
            // branches already handed out are still awaited below
            if let Err(e) = task_executor.execute(task) {
                tracing::error!(split = %self.name, error = %e, dispatched, "split branch rejected");
                rejected = Some(e);
                break;
            }
            dispatched += 1;
        }
        drop(tx);

        let mut results = Vec::with_capacity(dispatched);
        let mut first_error = None;
        for result in rx.iter().take(dispatched) {
            match result {
                Ok(execution) => results.push(execution),
                Err(e) => {
                    tracing::error!(split = %self.name, error = %e, "flow in split failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = rejected.or(first_error) {
            return Err(e);
        }
        if results.len() < dispatched {
            return Err(BatchError::FlowExecution(format!(
                "split {} lost {} of {} flow results",
                self.name,
                dispatched - results.len(),
                dispatched
            )));
        }
        Ok(aggregator.aggregate(&results))
    }
}

fn handle_end(
    status: &FlowExecutionStatus,
    code: &str,
    abandon: bool,
    executor: &Arc<dyn FlowExecutor>,
) -> BatchResult<FlowExecutionStatus> {
    // the last step could not finish: its outcome is unknown
    if let Some(step) = executor.step_execution() {
        if step.status == BatchStatus::Unknown {
            return Ok(FlowExecutionStatus::unknown());
        }
    }

    if status.is_stop() {
        if executor.is_restart() {
            // a stop state reached again on restart lets the flow continue
            return Ok(FlowExecutionStatus::completed());
        }
        if abandon {
            executor.abandon_step_execution()?;
        }
    }

    executor.add_exit_status(code);
    Ok(status.clone())
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            StateKind::Step(step) => format!("Step({})", step.name()),
            StateKind::Flow(flow) => format!("Flow({})", flow.name()),
            StateKind::Split { flows, .. } => format!("Split({} flows)", flows.len()),
            StateKind::Decision(_) => "Decision".to_string(),
            StateKind::End { status, code, .. } => format!("End({status}, {code})"),
        };
        f.debug_struct("State")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{step, RecordingExecutor};
    use crate::flow::{FlowBuilder, MaxValueFlowExecutionAggregator};
    use crate::task_executor::Task;
    use parking_lot::Mutex;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    /// Runs the first task on a slow worker thread and rejects the rest.
    #[derive(Default)]
    struct OneSlot {
        worker: Mutex<Option<JoinHandle<()>>>,
    }

    impl TaskExecutor for OneSlot {
        fn execute(&self, task: Task) -> BatchResult<()> {
            let mut worker = self.worker.lock();
            if worker.is_some() {
                return Err(BatchError::TaskRejected("pool exhausted".to_string()));
            }
            *worker = Some(thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                task();
            }));
            Ok(())
        }
    }

    #[test]
    fn test_split_waits_for_dispatched_branches_when_one_is_rejected() {
        let a = FlowBuilder::new("a").start(step("a1")).build().unwrap();
        let b = FlowBuilder::new("b").start(step("b1")).build().unwrap();
        let task_executor = Arc::new(OneSlot::default());
        let split = State::split(
            "fan-out",
            vec![a, b],
            task_executor.clone(),
            Arc::new(MaxValueFlowExecutionAggregator),
        );

        let executor = RecordingExecutor::new();
        let err = split.handle(&executor.as_dyn()).unwrap_err();
        assert!(matches!(err, BatchError::TaskRejected(_)));
        // the accepted branch finished before the split gave up
        assert_eq!(executor.executed(), vec!["a1"]);

        if let Some(worker) = task_executor.worker.lock().take() {
            worker.join().unwrap();
        }
        assert_eq!(executor.executed(), vec!["a1"]);
    }

    #[test]
    fn test_end_state_appends_exit_code() {
        let end = State::end("done", FlowExecutionStatus::completed(), "NOTHING TO DO", false);
        let executor = RecordingExecutor::new();
        let status = end.handle(&executor.as_dyn()).unwrap();
        assert_eq!(status, FlowExecutionStatus::completed());
        assert_eq!(executor.exit_status().exit_code, "NOTHING TO DO");
    }
}
