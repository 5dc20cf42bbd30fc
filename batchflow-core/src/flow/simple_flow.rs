use super::executor::FlowExecutor;
use super::state::State;
use super::status::{FlowExecution, FlowExecutionStatus};
use super::transition::StateTransition;
use super::Flow;
use crate::error::{BatchError, BatchResult};
use crate::execution::StepExecution;
use batchflow_context::{LinkedMap, BATCH_EXECUTED, BATCH_RESTART};
use std::collections::HashMap;
use std::sync::Arc;

/// A flow compiled from a list of state transitions.
///
/// The start state is the source of the first transition. Transitions out of
/// each state are tried most specific first.
pub struct SimpleFlow {
    name: String,
    start_state: Arc<State>,
    transitions: Vec<StateTransition>,
    transition_map: HashMap<String, Vec<StateTransition>>,
    state_map: LinkedMap<String, Arc<State>>,
}

impl SimpleFlow {
    pub fn new(name: impl Into<String>, transitions: Vec<StateTransition>) -> BatchResult<Self> {
        let name = name.into();
        let start_state = match transitions.first() {
            Some(first) => first.state.clone(),
            None => {
                return Err(BatchError::FlowDefinition(format!(
                    "flow {name} has no state transitions"
                )))
            }
        };

        let mut state_map: LinkedMap<String, Arc<State>> = LinkedMap::new();
        let mut transition_map: HashMap<String, Vec<StateTransition>> = HashMap::new();
        for transition in &transitions {
            let state_name = transition.state_name().to_string();
            match state_map.get(&state_name) {
                Some(existing) if !Arc::ptr_eq(existing, &transition.state) => {
                    return Err(BatchError::FlowDefinition(format!(
                        "flow {name} has two different states named {state_name}"
                    )));
                }
                Some(_) => {}
                None => {
                    state_map.insert(state_name.clone(), transition.state.clone());
                }
            }
            transition_map
                .entry(state_name)
                .or_default()
                .push(transition.clone());
        }

        for transition in &transitions {
            if let Some(next) = &transition.next {
                if !state_map.contains_key(next) {
                    return Err(BatchError::FlowDefinition(format!(
                        "missing state for transition [{transition}] in flow {name}"
                    )));
                }
            }
        }

        for candidates in transition_map.values_mut() {
            candidates.sort_by(|a, b| a.specificity_cmp(b));
        }

        tracing::debug!(
            flow = %name,
            states = state_map.len(),
            transitions = transitions.len(),
            "flow compiled"
        );

        Ok(Self {
            name,
            start_state,
            transitions,
            transition_map,
            state_map,
        })
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transitions out of `state_name`, in lookup order.
    pub fn transitions_from(&self, state_name: &str) -> &[StateTransition] {
        self.transition_map
            .get(state_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn next_state(
        &self,
        state_name: &str,
        status: &FlowExecutionStatus,
    ) -> BatchResult<Option<Arc<State>>> {
        let candidates = self.transition_map.get(state_name).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "no transitions found in flow={} for state={state_name}",
                self.name
            ))
        })?;

        let exit_code = status.name.as_str();
        let matched = candidates.iter().find(|transition| {
            transition.matches(exit_code)
                || (exit_code == FlowExecutionStatus::PENDING
                    && transition.matches(FlowExecutionStatus::STOPPED))
        });

        let next = match matched {
            Some(transition) => match &transition.next {
                Some(next) => next,
                None => return Ok(None),
            },
            None => {
                return Err(BatchError::FlowExecution(format!(
                    "next state not found in flow={} for state={state_name} with exit status={exit_code}",
                    self.name
                )))
            }
        };

        self.state_map.get(next).cloned().map(Some).ok_or_else(|| {
            BatchError::FlowExecution(format!(
                "next state not specified in flow={} for next={next}",
                self.name
            ))
        })
    }

    fn is_flow_continued(
        state: Option<&State>,
        status: &FlowExecutionStatus,
        step_execution: Option<&StepExecution>,
    ) -> bool {
        let Some(state) = state else {
            return false;
        };
        if status.name != FlowExecutionStatus::STOPPED {
            return true;
        }
        // a restarted step that stopped before doing any work lets the flow move on
        match step_execution {
            Some(step) => {
                let context = &step.execution_context;
                let executed = context.get_bool(BATCH_EXECUTED).unwrap_or(false);
                let rerun = context.get_bool(BATCH_RESTART).unwrap_or(false);
                !executed && rerun && !state.name.ends_with(&step.step_name)
            }
            None => false,
        }
    }
}

impl Flow for SimpleFlow {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, executor: &Arc<dyn FlowExecutor>) -> BatchResult<FlowExecution> {
        self.resume(&self.start_state.name, executor)
    }

    fn resume(
        &self,
        state_name: &str,
        executor: &Arc<dyn FlowExecutor>,
    ) -> BatchResult<FlowExecution> {
        let mut status = FlowExecutionStatus::unknown();
        let mut current_name = state_name.to_string();
        let mut state = match self.state_map.get(state_name) {
            Some(state) => Some(state.clone()),
            None => {
                return Err(BatchError::FlowExecution(format!(
                    "no state named {state_name} in flow={}",
                    self.name
                )))
            }
        };
        let mut step_execution: Option<StepExecution> = None;

        while Self::is_flow_continued(state.as_deref(), &status, step_execution.as_ref()) {
            let Some(current) = state.take() else {
                break;
            };
            current_name = current.name.clone();
            tracing::debug!(flow = %self.name, state = %current_name, "handling state");

            status = match current.handle(executor) {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(flow = %self.name, state = %current_name, error = %e, "flow ended with error");
                    executor.close(&FlowExecution::new(current_name.clone(), status.clone()));
                    return Err(e);
                }
            };
            step_execution = executor.step_execution();

            state = match self.next_state(&current_name, &status) {
                Ok(next) => next,
                Err(e) => {
                    executor.close(&FlowExecution::new(current_name.clone(), status.clone()));
                    return Err(e);
                }
            };
        }

        let result = FlowExecution::new(current_name, status);
        executor.close(&result);
        Ok(result)
    }

    fn get_state(&self, state_name: &str) -> Option<Arc<State>> {
        self.state_map.get(state_name).cloned()
    }

    fn state_names(&self) -> Vec<String> {
        self.state_map.keys().cloned().collect()
    }
}

impl std::fmt::Debug for SimpleFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleFlow")
            .field("name", &self.name)
            .field("start", &self.start_state.name)
            .field("transitions", &self.transitions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{step, RecordingExecutor};

    fn end(name: &str, status: FlowExecutionStatus) -> Arc<State> {
        let code = status.name.clone();
        Arc::new(State::end(name, status, code, false))
    }

    #[test]
    fn test_runs_states_by_exit_code() {
        let s1 = Arc::new(State::step("s1", step("s1")));
        let s2 = Arc::new(State::step("s2", step("s2")));
        let s3 = Arc::new(State::step("s3", step("s3")));
        let done = end("done", FlowExecutionStatus::completed());
        let flow = SimpleFlow::new(
            "f",
            vec![
                StateTransition::create_state_transition(s1.clone(), "*", "s3"),
                StateTransition::create_state_transition(s1.clone(), "FAILED", "s2"),
                StateTransition::create_state_transition(s2.clone(), "*", "done"),
                StateTransition::create_state_transition(s3.clone(), "*", "done"),
                StateTransition::create_end_state_transition(done),
            ],
        )
        .unwrap();

        let executor = RecordingExecutor::new().with_exit_code("s1", "FAILED");
        let result = flow.start(&executor.as_dyn()).unwrap();

        assert_eq!(executor.executed(), vec!["s1", "s2"]);
        assert_eq!(result.name, "done");
        assert_eq!(result.status, FlowExecutionStatus::completed());
        assert_eq!(executor.closed(), 1);
    }

    #[test]
    fn test_missing_next_state_is_definition_error() {
        let s1 = Arc::new(State::step("s1", step("s1")));
        let result = SimpleFlow::new(
            "f",
            vec![StateTransition::create_state_transition(s1, "*", "nowhere")],
        );
        assert!(matches!(result, Err(BatchError::FlowDefinition(_))));
        assert!(matches!(
            SimpleFlow::new("empty", Vec::new()),
            Err(BatchError::FlowDefinition(_))
        ));
    }

    #[test]
    fn test_unmatched_status_is_execution_error() {
        let s1 = Arc::new(State::step("s1", step("s1")));
        let done = end("done", FlowExecutionStatus::completed());
        let flow = SimpleFlow::new(
            "f",
            vec![
                StateTransition::create_state_transition(s1, "COMPLETED", "done"),
                StateTransition::create_end_state_transition(done),
            ],
        )
        .unwrap();

        let executor = RecordingExecutor::new().with_exit_code("s1", "FAILED");
        let err = flow.start(&executor.as_dyn()).unwrap_err();
        assert!(matches!(err, BatchError::FlowExecution(_)));
        assert_eq!(executor.closed(), 1);
    }

    #[test]
    fn test_pending_matches_stopped_transition() {
        let s1 = Arc::new(State::step("s1", step("s1")));
        let s2 = Arc::new(State::step("s2", step("s2")));
        let flow = SimpleFlow::new(
            "f",
            vec![
                StateTransition::create_state_transition(s1.clone(), "STOPPED", "s2"),
                StateTransition::create_end_state_transition_on(s1, "COMPLETED"),
                StateTransition::create_end_state_transition(s2),
            ],
        )
        .unwrap();

        let executor = RecordingExecutor::new().with_exit_code("s1", "PENDING");
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "s2"]);
        assert_eq!(result.name, "s2");
    }

    #[test]
    fn test_resume_from_named_state() {
        let s1 = Arc::new(State::step("s1", step("s1")));
        let s2 = Arc::new(State::step("s2", step("s2")));
        let flow = SimpleFlow::new(
            "f",
            vec![
                StateTransition::create_state_transition(s1, "*", "s2"),
                StateTransition::create_end_state_transition(s2),
            ],
        )
        .unwrap();

        let executor = RecordingExecutor::new();
        flow.resume("s2", &executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s2"]);
        assert_eq!(flow.state_names(), vec!["s1", "s2"]);
        assert!(flow.get_state("s1").is_some());
        assert!(flow.resume("missing", &executor.as_dyn()).is_err());
    }
}
