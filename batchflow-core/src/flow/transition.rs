use super::state::State;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Edge of the flow graph: from `state`, on an exit code matching `pattern`,
/// go to the state named `next`. Without `next` the flow ends.
#[derive(Clone)]
pub struct StateTransition {
    pub state: Arc<State>,
    pub pattern: String,
    pub next: Option<String>,
}

impl StateTransition {
    pub fn create_state_transition(
        state: Arc<State>,
        pattern: impl Into<String>,
        next: impl Into<String>,
    ) -> Self {
        Self {
            state,
            pattern: normalize(pattern.into()),
            next: Some(next.into()),
        }
    }

    /// Terminal transition matching every exit code.
    pub fn create_end_state_transition(state: Arc<State>) -> Self {
        Self::create_end_state_transition_on(state, "*")
    }

    pub fn create_end_state_transition_on(state: Arc<State>, pattern: impl Into<String>) -> Self {
        Self {
            state,
            pattern: normalize(pattern.into()),
            next: None,
        }
    }

    pub fn state_name(&self) -> &str {
        &self.state.name
    }

    pub fn is_end(&self) -> bool {
        self.next.is_none()
    }

    pub fn matches(&self, status: &str) -> bool {
        glob_match(&self.pattern, status)
    }

    pub fn is_exact(&self) -> bool {
        !self.pattern.contains(['*', '?'])
    }

    fn literal_chars(&self) -> usize {
        self.pattern.chars().filter(|c| *c != '*' && *c != '?').count()
    }

    /// Lookup priority: exact patterns first, then wildcard patterns with
    /// more literal characters. Equal priorities keep insertion order when
    /// used with a stable sort.
    pub fn specificity_cmp(&self, other: &StateTransition) -> Ordering {
        other
            .is_exact()
            .cmp(&self.is_exact())
            .then_with(|| other.literal_chars().cmp(&self.literal_chars()))
    }
}

fn normalize(pattern: String) -> String {
    if pattern.is_empty() {
        "*".to_string()
    } else {
        pattern
    }
}

/// Glob match supporting `*` (any run of characters) and `?` (one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

impl fmt::Debug for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTransition")
            .field("state", &self.state.name)
            .field("pattern", &self.pattern)
            .field("next", &self.next)
            .finish()
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.next {
            Some(next) => write!(f, "{} --[{}]--> {}", self.state.name, self.pattern, next),
            None => write!(f, "{} --[{}]--> <end>", self.state.name, self.pattern),
        }
    }
}
