//! Event dispatch boundary
//!
//! The engine notifies an `EventDispatcher` after successful writes and
//! delegates subscription tasks to it. Fan-out to subscribers is up to the
//! implementation. Notification never changes the result of a task.

use crate::error::TaskResult;
use crate::protocol::{ChangeKind, SubscribeChanges, SubscribeMessage};
use crate::types::JsonKey;
use parking_lot::Mutex;
use serde::Serialize;

/// Keys changed by one successful write task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub database: String,
    pub container: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub kind: ChangeKind,
    pub keys: Vec<JsonKey>,
}

pub trait EventDispatcher: Send + Sync {
    fn entities_changed(&self, event: ChangeEvent);

    fn subscribe_changes(&self, client_id: Option<&str>, command: &SubscribeChanges) -> TaskResult<()>;

    fn subscribe_message(&self, client_id: Option<&str>, command: &SubscribeMessage) -> TaskResult<()>;
}

/// Records events and subscriptions in memory
#[derive(Debug, Default)]
pub struct EventLog {
    changes: Mutex<Vec<ChangeEvent>>,
    subscriptions: Mutex<Vec<(Option<String>, String)>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog::default()
    }

    pub fn changes(&self) -> Vec<ChangeEvent> {
        self.changes.lock().clone()
    }

    /// (client id, subscribed container or message name)
    pub fn subscriptions(&self) -> Vec<(Option<String>, String)> {
        self.subscriptions.lock().clone()
    }
}

impl EventDispatcher for EventLog {
    fn entities_changed(&self, event: ChangeEvent) {
        self.changes.lock().push(event);
    }

    fn subscribe_changes(&self, client_id: Option<&str>, command: &SubscribeChanges) -> TaskResult<()> {
        let mut subscriptions = self.subscriptions.lock();
        let client = client_id.map(str::to_string);
        subscriptions.retain(|(c, name)| !(c == &client && name == &command.container));
        if !command.changes.is_empty() {
            subscriptions.push((client, command.container.clone()));
        }
        Ok(())
    }

    fn subscribe_message(&self, client_id: Option<&str>, command: &SubscribeMessage) -> TaskResult<()> {
        let mut subscriptions = self.subscriptions.lock();
        let client = client_id.map(str::to_string);
        subscriptions.retain(|(c, name)| !(c == &client && name == &command.name));
        if !command.remove {
            subscriptions.push((client, command.name.clone()));
        }
        Ok(())
    }
}
