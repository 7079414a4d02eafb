//! The user-supplied replicated state machine.

use crate::error::Result;

/// A Raft-managed state machine. The node applies committed log commands to
/// the state machine, in log order.
pub trait State: Send {
    /// Applies a committed command, returning its result. Apply is called
    /// exactly once per committed entry, in strictly ascending index order,
    /// and is never called concurrently with itself.
    ///
    /// Apply must be deterministic: given the same command sequence, every
    /// node must arrive at the same state. Returned errors are considered
    /// part of the result -- they are delivered to the submitting client and
    /// do not affect the log, so they must be deterministic too (e.g. a
    /// business rule violation). Non-deterministic failures such as IO errors
    /// must panic instead, taking the node down rather than letting replicas
    /// diverge.
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

#[cfg(test)]
pub mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::errinput;

    /// A state machine that records applied commands and echoes each command
    /// back as its result. Commands equal to b"error" fail, to exercise
    /// result delivery of state machine errors.
    #[derive(Clone, Default)]
    pub struct Echo {
        applied: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Echo {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns all applied commands, in order.
        pub fn applied(&self) -> Vec<Vec<u8>> {
            self.applied.lock().expect("lock poisoned").clone()
        }
    }

    impl State for Echo {
        fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            self.applied.lock().expect("lock poisoned").push(command.to_vec());
            if command == b"error" {
                return errinput!("command failed");
            }
            Ok(command.to_vec())
        }
    }
}
