//! Mutable builder compiling `start/next/from/on/split` calls into a
//! [`SimpleFlow`].

use super::executor::JobExecutionDecider;
use super::simple_flow::SimpleFlow;
use super::state::{State, StateKind};
use super::status::{FlowExecutionStatus, MaxValueFlowExecutionAggregator};
use super::transition::StateTransition;
use super::Flow;
use crate::error::{BatchError, BatchResult};
use crate::status::ExitStatus;
use crate::step::Step;
use crate::task_executor::TaskExecutor;
use batchflow_context::{LinkedMap, LinkedSet};
use std::collections::HashMap;
use std::sync::Arc;

/// Anything that can become a state of a flow.
#[derive(Clone)]
pub enum StateSource {
    Step(Arc<dyn Step>),
    Flow(Arc<dyn Flow>),
    Decider(Arc<dyn JobExecutionDecider>),
}

impl From<Arc<dyn Step>> for StateSource {
    fn from(step: Arc<dyn Step>) -> Self {
        StateSource::Step(step)
    }
}

impl From<Arc<dyn Flow>> for StateSource {
    fn from(flow: Arc<dyn Flow>) -> Self {
        StateSource::Flow(flow)
    }
}

impl From<Arc<dyn JobExecutionDecider>> for StateSource {
    fn from(decider: Arc<dyn JobExecutionDecider>) -> Self {
        StateSource::Decider(decider)
    }
}

/// Registration identity: the same `Arc` always maps to the same state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StateKey {
    Single(usize),
    Split(Vec<usize>),
}

fn identity<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

pub struct FlowBuilder {
    name: String,
    prefix: String,
    transitions: Vec<StateTransition>,
    tos: LinkedMap<String, Arc<State>>,
    states: HashMap<StateKey, Arc<State>>,
    current_state: Option<Arc<State>>,
    failed_state: Arc<State>,
    completed_state: Arc<State>,
    stopped_state: Arc<State>,
    decision_counter: usize,
    split_counter: usize,
    end_counter: usize,
    dirty: bool,
    flow: Option<Arc<dyn Flow>>,
    error: Option<String>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let prefix = format!("{name}.");
        let end_state = |label: &str, status: FlowExecutionStatus| {
            Arc::new(State::end(format!("{prefix}{label}"), status, label, false))
        };
        Self {
            failed_state: end_state(ExitStatus::FAILED, FlowExecutionStatus::failed()),
            completed_state: end_state(ExitStatus::COMPLETED, FlowExecutionStatus::completed()),
            stopped_state: end_state(ExitStatus::STOPPED, FlowExecutionStatus::stopped()),
            name,
            prefix,
            transitions: Vec::new(),
            tos: LinkedMap::new(),
            states: HashMap::new(),
            current_state: None,
            decision_counter: 0,
            split_counter: 0,
            end_counter: 0,
            dirty: true,
            flow: None,
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transitions recorded so far, including synthesized ones once built.
    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Sets the state the flow starts from.
    pub fn start(mut self, source: impl Into<StateSource>) -> Self {
        self.do_start(source.into());
        self
    }

    /// Continues with `source` when the current state completes.
    pub fn next(mut self, source: impl Into<StateSource>) -> Self {
        self.do_next(source.into());
        self
    }

    /// Makes `source` the current state so transitions can be added to it.
    pub fn from(mut self, source: impl Into<StateSource>) -> Self {
        self.do_from(source.into());
        self
    }

    pub fn on(self, pattern: impl Into<String>) -> TransitionBuilder {
        TransitionBuilder {
            parent: self,
            pattern: pattern.into(),
        }
    }

    pub fn split(self, task_executor: Arc<dyn TaskExecutor>) -> SplitBuilder {
        SplitBuilder {
            parent: self,
            task_executor,
        }
    }

    /// Compiles the flow. Returns the cached flow when nothing changed since
    /// the last build.
    pub fn build(&mut self) -> BatchResult<Arc<dyn Flow>> {
        if let Some(error) = &self.error {
            return Err(BatchError::FlowDefinition(error.clone()));
        }
        if !self.dirty {
            if let Some(flow) = &self.flow {
                return Ok(flow.clone());
            }
        }

        let single_flow = match (&self.current_state, self.states.len()) {
            (Some(state), 1) => match &state.kind {
                StateKind::Flow(flow) => Some(flow.clone()),
                _ => None,
            },
            _ => None,
        };
        if let Some(flow) = single_flow {
            self.flow = Some(flow.clone());
            self.dirty = false;
            return Ok(flow);
        }

        self.add_dangling_end_states();
        let flow: Arc<dyn Flow> = Arc::new(SimpleFlow::new(
            self.name.clone(),
            self.transitions.clone(),
        )?);
        self.flow = Some(flow.clone());
        self.dirty = false;
        Ok(flow)
    }

    /// Alias of [`FlowBuilder::build`].
    pub fn end(&mut self) -> BatchResult<Arc<dyn Flow>> {
        self.build()
    }

    fn do_start(&mut self, source: StateSource) {
        if self.current_state.is_some() {
            self.do_from(source);
        } else {
            self.current_state = Some(self.create_state(source));
        }
    }

    fn do_next(&mut self, source: StateSource) {
        if self.current_state.is_none() {
            self.do_start(source);
            return;
        }
        let next = self.create_state(source);
        self.add_transition(ExitStatus::COMPLETED, next.clone());
        self.current_state = Some(next);
    }

    fn do_from(&mut self, source: StateSource) {
        if self.current_state.is_none() {
            self.do_start(source.clone());
        }
        let state = self.create_state(source);
        if let Some(current) = &self.current_state {
            self.tos.insert(current.name.clone(), current.clone());
        }
        self.current_state = Some(state);
    }

    fn create_state(&mut self, source: StateSource) -> Arc<State> {
        self.dirty = true;
        let key = match &source {
            StateSource::Step(step) => StateKey::Single(identity(step)),
            StateSource::Flow(flow) => StateKey::Single(identity(flow)),
            StateSource::Decider(decider) => StateKey::Single(identity(decider)),
        };
        if let Some(existing) = self.states.get(&key) {
            return existing.clone();
        }

        let state = match source {
            StateSource::Step(step) => {
                State::step(format!("{}{}", self.prefix, step.name()), step)
            }
            StateSource::Flow(flow) => {
                State::flow(format!("{}{}", self.prefix, flow.name()), flow)
            }
            StateSource::Decider(decider) => {
                let name = format!("{}decision{}", self.prefix, self.decision_counter);
                self.decision_counter += 1;
                State::decision(name, decider)
            }
        };
        let state = Arc::new(state);
        self.states.insert(key, state.clone());
        state
    }

    fn create_split_state(
        &mut self,
        flows: Vec<Arc<dyn Flow>>,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> Arc<State> {
        self.dirty = true;
        let key = StateKey::Split(flows.iter().map(identity).collect());
        if let Some(existing) = self.states.get(&key) {
            return existing.clone();
        }
        let name = format!("{}split{}", self.prefix, self.split_counter);
        self.split_counter += 1;
        let state = Arc::new(State::split(
            name,
            flows,
            task_executor,
            Arc::new(MaxValueFlowExecutionAggregator),
        ));
        self.states.insert(key, state.clone());
        state
    }

    fn add_transition(&mut self, pattern: &str, next: Arc<State>) {
        self.add_transition_ending_on(pattern, next, &["*"]);
    }

    /// Adds `current --pattern--> next`. An end state target also gets its
    /// own end transitions on `end_patterns`.
    fn add_transition_ending_on(&mut self, pattern: &str, next: Arc<State>, end_patterns: &[&str]) {
        let Some(current) = self.current_state.clone() else {
            self.record_error(format!(
                "transition on {pattern} to {} has no source state",
                next.name
            ));
            return;
        };

        self.tos.insert(next.name.clone(), next.clone());
        self.transitions.push(StateTransition::create_state_transition(
            current,
            pattern,
            next.name.clone(),
        ));
        if self.transitions.len() == 1 {
            for end in [
                self.failed_state.clone(),
                self.completed_state.clone(),
                self.stopped_state.clone(),
            ] {
                self.transitions
                    .push(StateTransition::create_end_state_transition(end));
            }
        }
        if next.is_end_state() {
            for end_pattern in end_patterns {
                let exists = self
                    .transitions
                    .iter()
                    .any(|t| t.is_end() && t.state_name() == next.name && t.pattern == *end_pattern);
                if !exists {
                    self.transitions
                        .push(StateTransition::create_end_state_transition_on(
                            next.clone(),
                            *end_pattern,
                        ));
                }
            }
        }
        self.dirty = true;
    }

    fn has_transition_matching(&self, state_name: &str, status: &str) -> bool {
        self.transitions
            .iter()
            .any(|t| t.state_name() == state_name && t.matches(status))
    }

    /// Closes every state that has no way out on FAILED or COMPLETED.
    fn add_dangling_end_states(&mut self) {
        let saved = self.current_state.clone();
        let froms: LinkedSet<String> = self
            .transitions
            .iter()
            .map(|t| t.state_name().to_string())
            .collect();
        let mut sources: LinkedMap<String, Arc<State>> = LinkedMap::new();
        for transition in &self.transitions {
            if !sources.contains_key(transition.state_name()) {
                sources.insert(transition.state_name().to_string(), transition.state.clone());
            }
        }

        if self.tos.is_empty() {
            if let Some(current) = &self.current_state {
                self.tos.insert(current.name.clone(), current.clone());
            }
        }

        let dead_ends: Vec<Arc<State>> = self
            .tos
            .iter()
            .filter(|(name, state)| !froms.contains(*name) && !state.is_end_state())
            .map(|(_, state)| state.clone())
            .collect();
        for state in dead_ends {
            self.current_state = Some(state);
            self.add_transition(ExitStatus::FAILED, self.failed_state.clone());
            self.add_transition("*", self.completed_state.clone());
        }

        for (name, state) in sources.iter() {
            if state.is_end_state() {
                continue;
            }
            let lacks_failed = !self.has_transition_matching(name, ExitStatus::FAILED);
            let lacks_completed = !self.has_transition_matching(name, ExitStatus::COMPLETED);
            self.current_state = Some(state.clone());
            match (lacks_failed, lacks_completed) {
                (true, true) => {
                    self.add_transition(ExitStatus::COMPLETED, self.completed_state.clone());
                    self.add_transition("*", self.failed_state.clone());
                }
                (true, false) => self.add_transition("*", self.failed_state.clone()),
                (false, true) => self.add_transition("*", self.completed_state.clone()),
                (false, false) => {}
            }
        }

        self.current_state = saved;
    }

    fn record_error(&mut self, message: String) {
        tracing::warn!(flow = %self.name, error = %message, "invalid flow definition");
        self.error.get_or_insert(message);
    }
}

/// Adds a transition on one exit-code pattern out of the current state.
pub struct TransitionBuilder {
    parent: FlowBuilder,
    pattern: String,
}

impl TransitionBuilder {
    /// Goes to `source`, which becomes the current state.
    pub fn to(mut self, source: impl Into<StateSource>) -> FlowBuilder {
        let next = self.parent.create_state(source.into());
        self.parent.add_transition(&self.pattern, next.clone());
        self.parent.current_state = Some(next);
        self.parent
    }

    /// Ends the flow with COMPLETED.
    pub fn end(mut self) -> FlowBuilder {
        let completed = self.parent.completed_state.clone();
        self.parent.add_transition(&self.pattern, completed);
        self.parent
    }

    /// Ends the flow with COMPLETED and a custom exit code.
    pub fn end_with(mut self, exit_code: impl Into<String>) -> FlowBuilder {
        let name = format!("{}end{}", self.parent.prefix, self.parent.end_counter);
        self.parent.end_counter += 1;
        let state = Arc::new(State::end(
            name,
            FlowExecutionStatus::completed(),
            exit_code,
            false,
        ));
        self.parent.add_transition(&self.pattern, state);
        self.parent
    }

    pub fn fail(mut self) -> FlowBuilder {
        let failed = self.parent.failed_state.clone();
        self.parent.add_transition(&self.pattern, failed);
        self.parent
    }

    pub fn stop(mut self) -> FlowBuilder {
        let stopped = self.parent.stopped_state.clone();
        self.parent.add_transition(&self.pattern, stopped);
        self.parent
    }

    /// Stops the flow here; a restart resumes at `restart`, which becomes
    /// the current state.
    pub fn stop_and_restart(mut self, restart: impl Into<StateSource>) -> FlowBuilder {
        let restart = self.parent.create_state(restart.into());
        let name = format!("{}stop{}", self.parent.prefix, self.parent.end_counter);
        self.parent.end_counter += 1;
        let stop = Arc::new(State::end(
            name,
            FlowExecutionStatus::stopped(),
            ExitStatus::STOPPED,
            true,
        ));

        self.parent.add_transition_ending_on(
            &self.pattern,
            stop.clone(),
            &[FlowExecutionStatus::STOPPED, FlowExecutionStatus::UNKNOWN],
        );
        self.parent.current_state = Some(stop);
        self.parent.add_transition("*", restart.clone());
        self.parent.current_state = Some(restart);
        self.parent
    }
}

/// Runs several flows in parallel on a task executor.
pub struct SplitBuilder {
    parent: FlowBuilder,
    task_executor: Arc<dyn TaskExecutor>,
}

impl SplitBuilder {
    /// Adds the parallel branches. The current state, unless it is the
    /// builder's only flow, becomes one more branch.
    pub fn add(mut self, flows: Vec<Arc<dyn Flow>>) -> FlowBuilder {
        let mut branches = flows;
        let name = format!("split{}", self.parent.split_counter);
        self.parent.split_counter += 1;

        if let Some(current) = self.parent.current_state.clone() {
            match &current.kind {
                StateKind::Flow(flow) => {
                    if self.parent.states.len() == 1 {
                        branches.push(flow.clone());
                    }
                }
                _ => {
                    let mut wrapper = FlowBuilder::new(format!("{name}_{}", current.name));
                    wrapper.current_state = Some(current.clone());
                    match wrapper.build() {
                        Ok(flow) => branches.push(flow),
                        Err(e) => self.parent.record_error(e.to_string()),
                    }
                }
            }
        }

        let split = self.parent.create_split_state(branches, self.task_executor);
        self.parent.current_state = Some(split);
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{JobExecution, StepExecution};
    use crate::flow::test_support::{step, RecordingExecutor};
    use crate::task_executor::SyncTaskExecutor;

    fn assert_closed(builder: &FlowBuilder) {
        let transitions = builder.transitions();
        let mut names: Vec<&str> = transitions.iter().map(|t| t.state_name()).collect();
        names.dedup();
        for transition in transitions {
            if transition.state.is_end_state() {
                continue;
            }
            let name = transition.state_name();
            for status in ["FAILED", "COMPLETED"] {
                assert!(
                    transitions
                        .iter()
                        .any(|t| t.state_name() == name && t.matches(status)),
                    "state {name} has no transition for {status}"
                );
            }
        }
        for transition in transitions {
            if let Some(next) = &transition.next {
                assert!(names.contains(&next.as_str()), "{next} is not a source");
            }
        }
    }

    #[test]
    fn test_linear_flow_runs_in_order() {
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .next(step("s2"))
            .next(step("s3"));
        let flow = builder.build().unwrap();
        assert_closed(&builder);

        let executor = RecordingExecutor::new();
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "s2", "s3"]);
        assert_eq!(result.status, FlowExecutionStatus::completed());
        assert_eq!(result.name, "job.COMPLETED");
    }

    #[test]
    fn test_failed_step_reaches_failed_end() {
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .next(step("s2"))
            .next(step("s3"));
        let flow = builder.build().unwrap();

        let executor = RecordingExecutor::new().with_exit_code("s2", "FAILED");
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "s2"]);
        assert_eq!(result.status, FlowExecutionStatus::failed());
        assert_eq!(executor.exit_status().exit_code, "FAILED");
    }

    #[test]
    fn test_conditional_transitions_with_shared_state() {
        let s1 = step("s1");
        let mut builder = FlowBuilder::new("job")
            .start(s1.clone())
            .on("FAILED")
            .to(step("recover"))
            .from(s1)
            .on("*")
            .to(step("report"));
        let flow = builder.build().unwrap();
        assert_closed(&builder);
        assert_eq!(
            flow.state_names()
                .iter()
                .filter(|name| name.as_str() == "job.s1")
                .count(),
            1
        );

        let executor = RecordingExecutor::new().with_exit_code("s1", "FAILED");
        flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "recover"]);

        let executor = RecordingExecutor::new();
        flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "report"]);
    }

    #[test]
    fn test_decider_routes_by_custom_status() {
        let decider: Arc<dyn JobExecutionDecider> =
            Arc::new(|_: &JobExecution, step: Option<&StepExecution>| {
                match step.map(|s| s.exit_status.exit_code.as_str()) {
                    Some("COMPLETED") => FlowExecutionStatus::new("EVEN"),
                    _ => FlowExecutionStatus::new("ODD"),
                }
            });
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .next(decider.clone())
            .on("EVEN")
            .to(step("even"))
            .from(decider)
            .on("ODD")
            .to(step("odd"));
        let flow = builder.build().unwrap();
        assert_closed(&builder);

        let executor = RecordingExecutor::new();
        flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed(), vec!["s1", "even"]);
    }

    #[test]
    fn test_dead_end_gets_failed_and_completed_exits() {
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .on("COMPLETED")
            .to(step("s2"));
        builder.build().unwrap();
        assert_closed(&builder);

        let from_s2: Vec<_> = builder
            .transitions()
            .iter()
            .filter(|t| t.state_name() == "job.s2")
            .map(|t| (t.pattern.clone(), t.next.clone().unwrap_or_default()))
            .collect();
        assert_eq!(
            from_s2,
            vec![
                ("FAILED".to_string(), "job.FAILED".to_string()),
                ("*".to_string(), "job.COMPLETED".to_string()),
            ]
        );
    }

    #[test]
    fn test_end_with_custom_exit_code() {
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .on("*")
            .end_with("DONE_EARLY");
        let flow = builder.build().unwrap();

        let executor = RecordingExecutor::new();
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(result.status, FlowExecutionStatus::completed());
        assert_eq!(executor.exit_status().exit_code, "DONE_EARLY");
    }

    #[test]
    fn test_stop_and_restart() {
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .on("COMPLETED")
            .stop_and_restart(step("s2"));
        let flow = builder.build().unwrap();
        assert_closed(&builder);

        let first = RecordingExecutor::new();
        let result = flow.start(&first.as_dyn()).unwrap();
        assert_eq!(first.executed(), vec!["s1"]);
        assert!(result.status.is_stop());

        let restart = RecordingExecutor::new().restarting();
        let result = flow.start(&restart.as_dyn()).unwrap();
        assert_eq!(restart.executed(), vec!["s1", "s2"]);
        assert_eq!(result.status, FlowExecutionStatus::completed());
    }

    #[test]
    fn test_single_flow_state_compiles_to_that_flow() {
        let inner = FlowBuilder::new("inner").start(step("s1")).build().unwrap();
        let outer = FlowBuilder::new("outer").start(inner.clone()).build().unwrap();
        assert_eq!(identity(&outer), identity(&inner));
    }

    #[test]
    fn test_build_is_cached_until_changed() {
        let mut builder = FlowBuilder::new("job").start(step("s1"));
        let first = builder.build().unwrap();
        let second = builder.build().unwrap();
        assert_eq!(identity(&first), identity(&second));

        let mut builder = builder.next(step("s2"));
        let third = builder.build().unwrap();
        assert_ne!(identity(&first), identity(&third));
        assert_eq!(third.state_names().len(), 5);
    }

    #[test]
    fn test_split_runs_all_branches() {
        let a = FlowBuilder::new("a").start(step("a1")).next(step("a2")).build().unwrap();
        let b = FlowBuilder::new("b").start(step("b1")).build().unwrap();
        let mut builder = FlowBuilder::new("job")
            .start(a)
            .split(Arc::new(SyncTaskExecutor))
            .add(vec![b]);
        let flow = builder.build().unwrap();

        let executor = RecordingExecutor::new().with_exit_code("b1", "FAILED");
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed_sorted(), vec!["a1", "a2", "b1"]);
        assert_eq!(result.status, FlowExecutionStatus::failed());
    }

    #[test]
    fn test_split_wraps_current_step_state() {
        let b = FlowBuilder::new("b").start(step("b1")).build().unwrap();
        let mut builder = FlowBuilder::new("job")
            .start(step("s1"))
            .split(Arc::new(SyncTaskExecutor))
            .add(vec![b]);
        let flow = builder.build().unwrap();

        let executor = RecordingExecutor::new();
        let result = flow.start(&executor.as_dyn()).unwrap();
        assert_eq!(executor.executed_sorted(), vec!["b1", "s1"]);
        assert_eq!(result.status, FlowExecutionStatus::completed());
    }

    #[test]
    fn test_transition_without_source_is_definition_error() {
        let mut builder = FlowBuilder::new("job").on("*").end();
        assert!(matches!(builder.build(), Err(BatchError::FlowDefinition(_))));
    }
}
