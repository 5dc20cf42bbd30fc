use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Outcome of a flow state, named by an exit code.
///
/// Ordering follows the severity of the code prefix: COMPLETED < STOPPED <
/// FAILED < UNKNOWN. Names with no known prefix rank as COMPLETED; equal
/// ranks are ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowExecutionStatus {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Completed,
    Stopped,
    Failed,
    Unknown,
}

impl Rank {
    fn of(name: &str) -> Rank {
        if name.starts_with(FlowExecutionStatus::STOPPED) {
            Rank::Stopped
        } else if name.starts_with(FlowExecutionStatus::FAILED) {
            Rank::Failed
        } else if name.starts_with(FlowExecutionStatus::UNKNOWN) {
            Rank::Unknown
        } else {
            Rank::Completed
        }
    }
}

impl FlowExecutionStatus {
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const STOPPED: &'static str = "STOPPED";
    pub const FAILED: &'static str = "FAILED";
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const UNFINISHED: &'static str = "UNFINISHED";
    pub const PENDING: &'static str = "PENDING";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn unfinished() -> Self {
        Self::new(Self::UNFINISHED)
    }

    pub fn is_stop(&self) -> bool {
        self.name.starts_with(Self::STOPPED)
    }

    pub fn is_fail(&self) -> bool {
        self.name.starts_with(Self::FAILED)
    }

    pub fn is_complete(&self) -> bool {
        self.name.starts_with(Self::COMPLETED)
    }

    pub fn is_end(&self) -> bool {
        self.is_stop() || self.is_fail() || self.is_complete()
    }
}

impl PartialOrd for FlowExecutionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowExecutionStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        Rank::of(&self.name)
            .cmp(&Rank::of(&other.name))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Display for FlowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Final state name and status of a flow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExecution {
    pub name: String,
    pub status: FlowExecutionStatus,
}

impl FlowExecution {
    pub fn new(name: impl Into<String>, status: FlowExecutionStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}

impl PartialOrd for FlowExecution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowExecution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.status
            .cmp(&other.status)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Combines the results of the flows run by a split.
pub trait FlowExecutionAggregator: Send + Sync {
    fn aggregate(&self, executions: &[FlowExecution]) -> FlowExecutionStatus;
}

/// Picks the most severe status, or UNKNOWN when nothing ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxValueFlowExecutionAggregator;

impl FlowExecutionAggregator for MaxValueFlowExecutionAggregator {
    fn aggregate(&self, executions: &[FlowExecution]) -> FlowExecutionStatus {
        executions
            .iter()
            .max()
            .map(|execution| execution.status.clone())
            .unwrap_or_else(FlowExecutionStatus::unknown)
    }
}
