use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::correlation::CallOutcome;

/// A command waiting for its session to be able to take another Call.
#[derive(Debug)]
pub struct QueuedCommand {
    /// Id reserved in the session's correlation table at enqueue time
    pub message_id: String,
    pub action: String,
    pub payload: Value,
    pub enqueued_at: Instant,
    pub(crate) result_sink: oneshot::Sender<CallOutcome>,
}

impl QueuedCommand {
    pub(crate) fn discard(self) {
        let _ = self.result_sink.send(CallOutcome::SessionClosed);
    }
}

/// FIFO holding area for commands the gateway wants to send to one charge point.
#[derive(Debug, Default)]
pub struct CommandQueue {
    items: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, cmd: QueuedCommand) {
        self.items.push_back(cmd);
    }

    pub fn pop_front(&mut self) -> Option<QueuedCommand> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn actions(&self) -> Vec<String> {
        self.items.iter().map(|c| c.action.clone()).collect()
    }

    /// Drops every queued command, failing its waiter with `SessionClosed`.
    /// Returns the discarded message ids so their reservations can be released.
    pub fn discard_all(&mut self) -> Vec<String> {
        self.items
            .drain(..)
            .map(|cmd| {
                let id = cmd.message_id.clone();
                cmd.discard();
                id
            })
            .collect()
    }
}

/// Handle returned to whoever submitted a command.
#[derive(Debug)]
pub struct CommandTicket {
    pub identity: String,
    pub message_id: String,
    pub(crate) outcome: oneshot::Receiver<CallOutcome>,
}

impl CommandTicket {
    /// Waits until the Call is answered, times out, or the session ends.
    pub async fn wait(self) -> CallOutcome {
        self.outcome.await.unwrap_or(CallOutcome::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(id: &str, action: &str) -> (QueuedCommand, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let cmd = QueuedCommand {
            message_id: id.to_string(),
            action: action.to_string(),
            payload: json!({}),
            enqueued_at: Instant::now(),
            result_sink: tx,
        };
        (cmd, rx)
    }

    #[test]
    fn preserves_fifo_order() {
        let mut queue = CommandQueue::new();
        let (a, _ra) = command("1", "Reset");
        let (b, _rb) = command("2", "ClearCache");
        queue.push_back(a);
        queue.push_back(b);
        assert_eq!(queue.actions(), vec!["Reset", "ClearCache"]);
        assert_eq!(queue.pop_front().map(|c| c.message_id), Some("1".to_string()));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn discard_all_fails_waiters() {
        let mut queue = CommandQueue::new();
        let (a, ra) = command("1", "Reset");
        queue.push_back(a);
        let ticket = CommandTicket { identity: "CP-1".into(), message_id: "1".into(), outcome: ra };

        assert_eq!(queue.discard_all(), vec!["1".to_string()]);
        assert!(queue.is_empty());
        assert_eq!(ticket.wait().await, CallOutcome::SessionClosed);
    }
}
