//! # Task Scopes
//!
//! Structured concurrency for background loops. A component creates a
//! [`TaskScope`] when it starts, spawns its loops into it and shuts it down
//! when it stops. Shutdown signals every task through its [`Shutdown`]
//! token and joins them; nothing outlives the scope.
//!
//! ```text
//! parent scope ──cancel──▶ child scope ──cancel──▶ tasks
//!                                └──── join ◀──────┘
//! ```

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Cancellation token handed to tasks.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Also resolves if the owning scope was dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Owner of a set of background tasks.
#[derive(Debug)]
pub struct TaskScope {
    name: String,
    cancel: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskScope {
    /// Creates an empty scope.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (cancel, _rx) = watch::channel(false);
        Self {
            name: name.into(),
            cancel,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Creates a scope that is cancelled when `parent` is.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn child_of(name: impl Into<String>, parent: &Shutdown) -> Self {
        let scope = Self::new(name);
        let parent = parent.clone();
        let own = scope.token();
        let cancel = scope.cancel.clone();
        scope.tasks.lock().spawn(async move {
            tokio::select! {
                () = parent.cancelled() => {
                    cancel.send_replace(true);
                }
                () = own.cancelled() => {}
            }
        });
        scope
    }

    /// Scope name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token observing this scope's cancellation.
    #[must_use]
    pub fn token(&self) -> Shutdown {
        Shutdown {
            rx: self.cancel.subscribe(),
        }
    }

    /// Spawns a task owned by this scope.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(scope = %self.name, task, "spawning task");
        self.tasks.lock().spawn(future);
    }

    /// Requests cancellation without waiting.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Cancels every task and waits for all of them to finish.
    pub async fn shutdown(&self) {
        self.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(scope = %self.name, error = %e, "task panicked");
                }
            }
        }
        debug!(scope = %self.name, "scope shut down");
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        // JoinSet aborts whatever is still running when dropped.
        self.cancel.send_replace(true);
    }
}
