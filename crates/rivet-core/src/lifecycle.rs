//! Startup/shutdown guard shared by the facades.

use parking_lot::Mutex;

use crate::error::RemotingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Started,
    Stopped,
}

/// Idempotence guard: start once, stop any number of times, never restart.
pub struct LifeCycle {
    state: Mutex<State>,
}

impl LifeCycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::New),
        }
    }

    pub fn startup(&self) -> Result<(), RemotingError> {
        let mut state = self.state.lock();
        match *state {
            State::New => {
                *state = State::Started;
                Ok(())
            }
            State::Started => Err(RemotingError::Lifecycle("already started")),
            State::Stopped => Err(RemotingError::Lifecycle("cannot restart after shutdown")),
        }
    }

    /// Returns true on the transition out of Started; later calls are
    /// no-ops.
    pub fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        let was_started = *state == State::Started;
        *state = State::Stopped;
        was_started
    }

    pub fn is_started(&self) -> bool {
        *self.state.lock() == State::Started
    }

    pub fn ensure_started(&self) -> Result<(), RemotingError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(RemotingError::Lifecycle("instance is not started"))
        }
    }
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_startup_fails() {
        let lc = LifeCycle::new();
        lc.startup().unwrap();
        assert!(lc.startup().is_err());
    }

    #[test]
    fn shutdown_is_repeatable_and_final() {
        let lc = LifeCycle::new();
        lc.startup().unwrap();
        assert!(lc.shutdown());
        assert!(!lc.shutdown());
        assert!(lc.startup().is_err());
        assert!(lc.ensure_started().is_err());
    }
}
