//! Transaction controller (C4) and per-connection `Session` state. Never
//! shared across connections: owned outright by the connection task.

use crate::error::RedpointError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    InTx,
}

pub struct QueuedCommand {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

/// Commands that may be queued inside a MULTI block in this subset. Any
/// other recognized command issued while `InTx` runs immediately rather
/// than being queued (see §4.4).
pub fn is_queueable(name: &str) -> bool {
    matches!(name, "set" | "get" | "incr")
}

pub struct Session {
    state: SessionState,
    queue: Vec<QueuedCommand>,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            state: SessionState::Normal,
            queue: Vec::new(),
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Session::default()
    }

    pub fn in_tx(&self) -> bool {
        self.state == SessionState::InTx
    }

    pub fn multi(&mut self) -> Result<(), RedpointError> {
        if self.in_tx() {
            return Err(RedpointError::NestedMulti);
        }
        self.state = SessionState::InTx;
        Ok(())
    }

    pub fn discard(&mut self) -> Result<(), RedpointError> {
        if !self.in_tx() {
            return Err(RedpointError::DiscardWithoutMulti);
        }
        self.state = SessionState::Normal;
        self.queue.clear();
        Ok(())
    }

    pub fn queue(&mut self, name: String, args: Vec<Vec<u8>>) {
        self.queue.push(QueuedCommand { name, args });
    }

    /// Ends the transaction and hands back the queued commands in
    /// insertion order for the caller to execute against the live
    /// keyspace. Errors if no MULTI is open.
    pub fn exec(&mut self) -> Result<Vec<QueuedCommand>, RedpointError> {
        if !self.in_tx() {
            return Err(RedpointError::ExecWithoutMulti);
        }
        self.state = SessionState::Normal;
        Ok(std::mem::take(&mut self.queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_then_exec_round_trips_the_queue() {
        let mut session = Session::new();
        session.multi().unwrap();
        session.queue("set".into(), vec![b"k".to_vec(), b"v".to_vec()]);
        session.queue("incr".into(), vec![b"k".to_vec()]);
        let queued = session.exec().unwrap();
        assert_eq!(queued.len(), 2);
        assert!(!session.in_tx());
    }

    #[test]
    fn exec_without_multi_is_an_error() {
        let mut session = Session::new();
        assert!(matches!(
            session.exec(),
            Err(RedpointError::ExecWithoutMulti)
        ));
    }

    #[test]
    fn discard_without_multi_is_an_error() {
        let mut session = Session::new();
        assert!(matches!(
            session.discard(),
            Err(RedpointError::DiscardWithoutMulti)
        ));
    }

    #[test]
    fn nested_multi_is_rejected() {
        let mut session = Session::new();
        session.multi().unwrap();
        assert!(matches!(session.multi(), Err(RedpointError::NestedMulti)));
    }

    #[test]
    fn empty_exec_queue_is_empty_vec() {
        let mut session = Session::new();
        session.multi().unwrap();
        assert_eq!(session.exec().unwrap().len(), 0);
    }
}
