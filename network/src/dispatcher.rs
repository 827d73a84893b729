//! Route out-of-band task events to the task they concern.

use crate::{
    utils::{read, write},
    Error, TaskId,
};
use bytes::Bytes;
use futures::channel::mpsc;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::debug;

/// Event delivered to a running task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task must stop consuming and producing buffers.
    Cancel,
    /// Application-defined payload.
    User(Bytes),
}

/// Registry of task mailboxes.
#[derive(Clone, Default)]
pub struct Dispatcher {
    tasks: Arc<RwLock<HashMap<TaskId, mpsc::UnboundedSender<TaskEvent>>>>,
}

impl Dispatcher {
    /// Register `task`, returning the stream its events are delivered on.
    pub fn register(&self, task: TaskId) -> Result<mpsc::UnboundedReceiver<TaskEvent>, Error> {
        let mut tasks = write(&self.tasks);
        if tasks.get(&task).is_some_and(|sender| !sender.is_closed()) {
            return Err(Error::TaskExists(task));
        }
        let (sender, receiver) = mpsc::unbounded();
        tasks.insert(task, sender);
        Ok(receiver)
    }

    /// Stop delivering events to `task`.
    ///
    /// Returns `false` if the task was not registered.
    pub fn unregister(&self, task: TaskId) -> bool {
        write(&self.tasks).remove(&task).is_some()
    }

    /// Deliver `event` to `task`.
    ///
    /// Returns `false` if the task is not registered or no longer listening.
    pub fn publish(&self, task: TaskId, event: TaskEvent) -> bool {
        let delivered = read(&self.tasks)
            .get(&task)
            .is_some_and(|sender| sender.unbounded_send(event).is_ok());
        if !delivered {
            debug!(%task, "dropped event for unknown task");
        }
        delivered
    }

    /// Returns the number of registered tasks.
    pub fn len(&self) -> usize {
        read(&self.tasks).len()
    }

    /// Returns whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister every task, ending their event streams.
    pub fn clear(&self) {
        write(&self.tasks).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, StreamExt};

    #[test]
    fn test_publish_to_registered() {
        let dispatcher = Dispatcher::default();
        let mut events = dispatcher.register(TaskId(1)).unwrap();
        assert!(dispatcher.publish(TaskId(1), TaskEvent::User(Bytes::from_static(b"hi"))));
        assert!(dispatcher.publish(TaskId(1), TaskEvent::Cancel));
        assert!(!dispatcher.publish(TaskId(2), TaskEvent::Cancel));

        // Events arrive in order
        assert_eq!(
            block_on(events.next()),
            Some(TaskEvent::User(Bytes::from_static(b"hi")))
        );
        assert_eq!(block_on(events.next()), Some(TaskEvent::Cancel));
    }

    #[test]
    fn test_register_twice() {
        let dispatcher = Dispatcher::default();
        let events = dispatcher.register(TaskId(1)).unwrap();
        assert!(matches!(
            dispatcher.register(TaskId(1)),
            Err(Error::TaskExists(TaskId(1)))
        ));

        // A task that stopped listening can register again
        drop(events);
        assert!(!dispatcher.publish(TaskId(1), TaskEvent::Cancel));
        assert!(dispatcher.register(TaskId(1)).is_ok());
    }

    #[test]
    fn test_unregister_and_clear() {
        let dispatcher = Dispatcher::default();
        let mut first = dispatcher.register(TaskId(1)).unwrap();
        let mut second = dispatcher.register(TaskId(2)).unwrap();
        assert_eq!(dispatcher.len(), 2);

        assert!(dispatcher.unregister(TaskId(1)));
        assert!(!dispatcher.unregister(TaskId(1)));
        assert_eq!(block_on(first.next()), None);

        dispatcher.clear();
        assert!(dispatcher.is_empty());
        assert_eq!(block_on(second.next()), None);
    }
}
