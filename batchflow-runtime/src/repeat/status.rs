use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one repeat iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatStatus {
    /// More work is available.
    Continuable,
    /// Processing is done.
    Finished,
}

impl RepeatStatus {
    pub fn continue_if(continuable: bool) -> Self {
        if continuable {
            RepeatStatus::Continuable
        } else {
            RepeatStatus::Finished
        }
    }

    pub fn is_continuable(&self) -> bool {
        *self == RepeatStatus::Continuable
    }

    /// Continuable only if both are.
    pub fn and(self, other: RepeatStatus) -> RepeatStatus {
        Self::continue_if(self.is_continuable() && other.is_continuable())
    }
}

impl fmt::Display for RepeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatStatus::Continuable => f.write_str("CONTINUABLE"),
            RepeatStatus::Finished => f.write_str("FINISHED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and() {
        use RepeatStatus::*;
        assert_eq!(Continuable.and(Continuable), Continuable);
        assert_eq!(Continuable.and(Finished), Finished);
        assert_eq!(Finished.and(Continuable), Finished);
        assert!(RepeatStatus::continue_if(true).is_continuable());
        assert_eq!(Finished.to_string(), "FINISHED");
    }
}
