use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Lifecycle state of a job or step execution.
///
/// Variants are declared in ascending order; `max` and `upgrade_to` rely on
/// it so a status can only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    #[default]
    Unknown,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Completed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 8] = [
        BatchStatus::Unknown,
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Abandoned,
        BatchStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Unknown => "UNKNOWN",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Completed => "COMPLETED",
        }
    }

    pub fn max(self, other: BatchStatus) -> BatchStatus {
        std::cmp::max(self, other)
    }

    /// Status after an upgrade request: never moves backwards.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        self.max(other)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
        )
    }

    pub fn is_less_than(&self, other: BatchStatus) -> bool {
        *self < other
    }

    pub fn is_greater_than(&self, other: BatchStatus) -> bool {
        *self > other
    }

    /// Finds the status whose name prefixes `name`, e.g. `"COMPLETED WITH
    /// SKIPS"` maps to `Completed`. Falls back to `Unknown`.
    pub fn match_status(name: &str) -> BatchStatus {
        BatchStatus::ALL
            .into_iter()
            .find(|status| name.starts_with(status.as_str()))
            .unwrap_or(BatchStatus::Unknown)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code plus a free-form description summarising how an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl Default for ExitStatus {
    fn default() -> Self {
        ExitStatus::executing()
    }
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn with_description(
        exit_code: impl Into<String>,
        exit_description: impl Into<String>,
    ) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: exit_description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    /// Combines two statuses: the more severe code wins and the descriptions
    /// are concatenated.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        let mut result = self.add_exit_description(&other.exit_description);
        if self.compare_severity(other) == Ordering::Less {
            result.exit_code = other.exit_code.clone();
        }
        result
    }

    pub fn add_exit_description(&self, description: &str) -> ExitStatus {
        let description = description.trim();
        let exit_description = if description.is_empty()
            || self.exit_description == description
        {
            self.exit_description.clone()
        } else if self.exit_description.is_empty() {
            description.to_string()
        } else {
            format!("{}; {}", self.exit_description, description)
        };
        ExitStatus {
            exit_code: self.exit_code.clone(),
            exit_description,
        }
    }

    /// Appends the error and its cause chain to the description.
    pub fn add_exit_description_from_error(&self, error: &anyhow::Error) -> ExitStatus {
        self.add_exit_description(&format!("{error:#}"))
    }

    pub fn replace_exit_code(&self, exit_code: impl Into<String>) -> ExitStatus {
        ExitStatus {
            exit_code: exit_code.into(),
            exit_description: self.exit_description.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING || self.exit_code == Self::UNKNOWN
    }

    fn severity(&self) -> u8 {
        let code = self.exit_code.as_str();
        if code.starts_with(Self::EXECUTING) {
            1
        } else if code.starts_with(Self::COMPLETED) {
            2
        } else if code.starts_with(Self::NOOP) {
            3
        } else if code.starts_with(Self::STOPPED) {
            4
        } else if code.starts_with(Self::FAILED) {
            5
        } else if code.starts_with(Self::UNKNOWN) {
            6
        } else {
            7
        }
    }

    fn compare_severity(&self, other: &ExitStatus) -> Ordering {
        self.severity()
            .cmp(&other.severity())
            .then_with(|| self.exit_code.cmp(&other.exit_code))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exitCode={};exitDescription={}",
            self.exit_code, self.exit_description
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_ordering() {
        assert!(BatchStatus::Unknown < BatchStatus::Starting);
        assert!(BatchStatus::Stopping < BatchStatus::Stopped);
        assert!(BatchStatus::Abandoned < BatchStatus::Completed);
        assert_eq!(
            BatchStatus::Started.max(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Completed.upgrade_to(BatchStatus::Started),
            BatchStatus::Completed
        );
        assert!(BatchStatus::Started.is_less_than(BatchStatus::Stopping));
    }

    #[test]
    fn test_match_status_by_prefix() {
        assert_eq!(
            BatchStatus::match_status("COMPLETED WITH SKIPS"),
            BatchStatus::Completed
        );
        assert_eq!(BatchStatus::match_status("STOPPED"), BatchStatus::Stopped);
        assert_eq!(BatchStatus::match_status("CUSTOM"), BatchStatus::Unknown);
    }

    #[test]
    fn test_exit_status_and_keeps_most_severe_code() {
        let combined = ExitStatus::executing().and(&ExitStatus::completed());
        assert_eq!(combined.exit_code, "COMPLETED");

        let combined = ExitStatus::failed().and(&ExitStatus::completed());
        assert_eq!(combined.exit_code, "FAILED");

        let custom = ExitStatus::completed().and(&ExitStatus::new("CUSTOM"));
        assert_eq!(custom.exit_code, "CUSTOM");
    }

    #[test]
    fn test_exit_status_and_joins_descriptions() {
        let a = ExitStatus::with_description("COMPLETED", "first");
        let b = ExitStatus::with_description("NOOP", "second");
        let combined = a.and(&b);
        assert_eq!(combined.exit_code, "NOOP");
        assert_eq!(combined.exit_description, "first; second");

        let same = a.and(&a);
        assert_eq!(same.exit_description, "first");
    }

    #[test]
    fn test_exit_description_from_error_includes_cause() {
        let err = anyhow::anyhow!("disk full").context("write failed");
        let status = ExitStatus::failed().add_exit_description_from_error(&err);
        assert!(status.exit_description.contains("write failed"));
        assert!(status.exit_description.contains("disk full"));
    }
}
