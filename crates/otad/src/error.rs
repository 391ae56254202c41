//! Transient/fatal error classification.
//!
//! Every failure crossing the controller boundary is an [`AgentError`]: an
//! underlying cause plus a fatal flag. The flag is the only signal the state
//! machine consults when choosing between the retry path and termination.

use std::fmt;

pub struct AgentError {
    cause: anyhow::Error,
    fatal: bool,
}

impl AgentError {
    /// An error the agent recovers from by looping back through `init` or a
    /// wait state.
    pub fn transient(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            fatal: false,
        }
    }

    /// An error that terminates the agent.
    pub fn fatal(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn into_cause(self) -> anyhow::Error {
        self.cause
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fatal {
            write!(f, "fatal: {:#}", self.cause)
        } else {
            write!(f, "transient: {:#}", self.cause)
        }
    }
}

impl fmt::Debug for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentError")
            .field("fatal", &self.fatal)
            .field("cause", &self.cause)
            .finish()
    }
}
