//! Undo actions for a creation attempt, run newest-first on failure

use futures_util::future::BoxFuture;
use std::{fmt, future::Future};

/// Error type returned by undo actions
pub type UndoError = Box<dyn std::error::Error + Send + Sync>;

/// A named, not yet started undo action
pub struct UndoAction {
    description: String,
    action: BoxFuture<'static, Result<(), UndoError>>,
}

impl UndoAction {
    /// Wrap a future as an undo action
    ///
    /// Futures are lazy, so nothing runs until the stack unwinds.
    pub fn new<S, F>(description: S, action: F) -> Self
    where
        S: Into<String>,
        F: Future<Output = Result<(), UndoError>> + Send + 'static,
    {
        UndoAction {
            description: description.into(),
            action: Box::pin(action),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UndoAction").field(&self.description).finish()
    }
}

/// An undo action that failed while unwinding
#[derive(Debug)]
pub struct UndoFailure {
    pub description: String,
    pub error: UndoError,
}

impl fmt::Display for UndoFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.error)
    }
}

/// Ordered sequence of undo actions for one creation attempt
///
/// Each step that acquires a resource registers its undo right after the
/// acquisition succeeds. On failure the stack is unwound in reverse order,
/// and every action runs even if earlier ones fail. On success the stack is
/// discarded without running anything.
///
/// A stack dropped while still holding actions (for example by a panic
/// between steps) unwinds itself on the current tokio runtime.
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<UndoAction>,
}

impl CleanupStack {
    pub fn new() -> Self {
        CleanupStack {
            actions: Vec::new(),
        }
    }

    /// Append an undo action
    pub fn add<S, F>(&mut self, description: S, action: F)
    where
        S: Into<String>,
        F: Future<Output = Result<(), UndoError>> + Send + 'static,
    {
        self.push(UndoAction::new(description, action));
    }

    pub fn push(&mut self, action: UndoAction) {
        log::trace!("cleanup registered: {}", action.description);
        self.actions.push(action);
    }

    /// Append a batch of actions, in order
    pub fn extend<I: IntoIterator<Item = UndoAction>>(&mut self, actions: I) {
        for action in actions {
            self.push(action);
        }
    }

    /// Move every action from `other` onto the top of this stack
    pub fn append(&mut self, mut other: CleanupStack) {
        self.actions.append(&mut other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Descriptions in the order they would run
    pub fn descriptions(&self) -> Vec<&str> {
        self.actions
            .iter()
            .rev()
            .map(|action| action.description.as_str())
            .collect()
    }

    /// Run every action newest-first, collecting failures instead of stopping
    pub async fn unwind(mut self) -> Vec<UndoFailure> {
        let mut failures = Vec::new();
        while let Some(UndoAction {
            description,
            action,
        }) = self.actions.pop()
        {
            log::debug!("cleanup: {}", description);
            if let Err(error) = action.await {
                log::warn!("cleanup step failed, {}: {}", description, error);
                failures.push(UndoFailure { description, error });
            }
        }
        failures
    }

    /// Drop every action without running it
    pub fn discard(mut self) {
        self.actions.clear();
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        let actions = std::mem::take(&mut self.actions);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!(
                    "cleanup stack dropped with {} pending actions, unwinding in the background",
                    actions.len()
                );
                handle.spawn(CleanupStack { actions }.unwind());
            }
            Err(_) => {
                for action in actions.iter().rev() {
                    log::error!("leaked without cleanup: {}", action.description);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::runtime::Runtime;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str, fail: bool) -> UndoAction {
        let log = log.clone();
        let name = name.to_string();
        UndoAction::new(format!("undo {}", name), async move {
            log.lock().unwrap().push(name.clone());
            let result: Result<(), UndoError> = if fail {
                Err(format!("{} failed", name).into())
            } else {
                Ok(())
            };
            result
        })
    }

    #[test]
    fn unwinds_newest_first() {
        Runtime::new().unwrap().block_on(async {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut stack = CleanupStack::new();
            stack.push(recorder(&log, "a", false));
            stack.push(recorder(&log, "b", false));
            stack.push(recorder(&log, "c", false));
            assert_eq!(stack.descriptions(), vec!["undo c", "undo b", "undo a"]);
            assert!(stack.unwind().await.is_empty());
            assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        })
    }

    #[test]
    fn unwind_continues_past_failures() {
        Runtime::new().unwrap().block_on(async {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut stack = CleanupStack::new();
            stack.push(recorder(&log, "a", true));
            stack.push(recorder(&log, "b", true));
            stack.push(recorder(&log, "c", false));
            let failures = stack.unwind().await;
            assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
            assert_eq!(failures.len(), 2);
            assert_eq!(failures[0].description, "undo b");
            assert_eq!(failures[1].to_string(), "undo a: a failed");
        })
    }

    #[test]
    fn discard_runs_nothing() {
        Runtime::new().unwrap().block_on(async {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut stack = CleanupStack::new();
            stack.push(recorder(&log, "a", false));
            stack.discard();
            tokio::task::yield_now().await;
            assert!(log.lock().unwrap().is_empty());
        })
    }

    #[test]
    fn dropped_stack_unwinds_in_background() {
        Runtime::new().unwrap().block_on(async {
            let log = Arc::new(Mutex::new(Vec::new()));
            let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
            {
                let mut stack = CleanupStack::new();
                stack.push(UndoAction::new("signal", async move {
                    let _ = done_tx.send(());
                    Ok(())
                }));
                stack.push(recorder(&log, "a", false));
            }
            done_rx.await.unwrap();
            assert_eq!(*log.lock().unwrap(), vec!["a"]);
        })
    }

    #[test]
    fn append_keeps_order() {
        Runtime::new().unwrap().block_on(async {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut outer = CleanupStack::new();
            outer.push(recorder(&log, "a", false));
            let mut inner = CleanupStack::new();
            inner.push(recorder(&log, "b", false));
            inner.push(recorder(&log, "c", false));
            outer.append(inner);
            assert_eq!(outer.len(), 3);
            outer.unwind().await;
            assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        })
    }
}
