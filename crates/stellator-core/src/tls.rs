//! Thread-local task context
//!
//! While a task's callbacks run, the executing thread knows which task,
//! server and group it is working for. Nested code (storage access,
//! logging, follow-up submissions) reads it from here instead of having it
//! threaded through every call.

use crate::group::TaskGroup;
use crate::server::{Server, StorageHandle};
use crate::task::{Task, TaskId};
use std::cell::RefCell;
use std::sync::Arc;

struct Context {
    task: TaskId,
    server: Option<Server>,
    group: Option<Arc<TaskGroup>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped.
pub(crate) struct ContextGuard {
    prev: Option<Context>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Make `task` the current task until the guard drops.
pub(crate) fn enter(task: &Task) -> ContextGuard {
    let ctx = Context {
        task: task.id(),
        server: task.server().cloned(),
        group: task.group().cloned(),
    };
    let prev = CURRENT.with(|cell| cell.borrow_mut().replace(ctx));
    ContextGuard { prev }
}

/// Id of the task running on this thread
#[inline]
pub fn current_task_id() -> Option<TaskId> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|c| c.task))
}

/// Server of the task running on this thread
pub fn current_server() -> Option<Server> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(|c| c.server.clone()))
}

/// Group of the task running on this thread
pub fn current_group() -> Option<Arc<TaskGroup>> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(|c| c.group.clone()))
}

#[inline]
pub fn is_in_task() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

/// Run `f` with a storage handle from the current task's server.
///
/// Returns `false` when called outside a task or when the server has no
/// storage configured.
pub fn perform_with_storage<F>(mut f: F) -> bool
where
    F: FnMut(&mut dyn StorageHandle) -> bool,
{
    // no borrow of CURRENT is held while `f` runs
    match current_server() {
        Some(server) => server.perform_with_storage(&mut f),
        None => {
            tracing::warn!("perform_with_storage called outside of a task");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{CountingHandle, CountingStorage};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_outside_task() {
        assert!(!is_in_task());
        assert!(current_task_id().is_none());
        assert!(current_server().is_none());
        assert!(current_group().is_none());
        assert!(!perform_with_storage(|_| true));
    }

    #[test]
    fn test_nested_enter_restores() {
        let outer = Task::new();
        let inner = Task::new();
        {
            let _a = enter(&outer);
            assert_eq!(current_task_id(), Some(outer.id()));
            {
                let _b = enter(&inner);
                assert_eq!(current_task_id(), Some(inner.id()));
            }
            assert_eq!(current_task_id(), Some(outer.id()));
        }
        assert!(!is_in_task());
    }

    #[test]
    fn test_storage_through_current_server() {
        let storage = Arc::new(CountingStorage::default());
        let server = Server::builder("db").storage(storage.clone()).build();
        let group = TaskGroup::new();

        let mut task = Task::prepare_in_group(&group, |t| {
            t.set_server(server.clone());
            t.add_execute_fn(|_| {
                assert!(current_group().is_some());
                perform_with_storage(|h| h.as_any_mut().downcast_mut::<CountingHandle>().is_some())
            });
        });
        task.run();

        assert!(task.is_successful());
        assert_eq!(storage.opened.load(Ordering::SeqCst), 1);
        assert_eq!(storage.released.load(Ordering::SeqCst), 1);
    }
}
