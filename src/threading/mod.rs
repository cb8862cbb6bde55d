//! Execution contexts bridging the manager's thread and the caller's
//!
//! The manager delivers notifications on its own thread, which must
//! pump promptly no matter what the caller is doing; callers often
//! have thread-affinity expectations of their own (a UI thread). Both
//! sides of that divide are a [`ThreadContext`]: `invoke` runs an
//! action on the context's thread and blocks until it finishes,
//! surfacing the action's failure to the caller; `begin_invoke` posts
//! and returns, swallowing failures since nobody is waiting.

use crate::errors::{Result, TwainError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

/// An action posted to a context.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// An execution context actions can be marshaled onto.
pub trait ThreadContext: Send + Sync {
    /// Runs `action` on the context's thread, blocking the calling
    /// thread until it completes. A panicking action is reported as a
    /// threading error on the calling thread.
    fn invoke(&self, action: Action) -> Result<()>;

    /// Posts `action` to the context's thread and returns immediately.
    /// Best-effort; failures are logged and swallowed.
    fn begin_invoke(&self, action: Action);

    /// Starts the context. Idempotent.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops the context, draining nothing further. Idempotent.
    fn stop(&self) {}
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "action panicked".to_string()
    }
}

/// Runs actions inline on the calling thread.
///
/// The executor for callers without thread-affinity expectations; also
/// the delivery mode when no external context is configured.
#[derive(Debug, Default)]
pub struct InlineContext;

impl ThreadContext for InlineContext {
    fn invoke(&self, action: Action) -> Result<()> {
        catch_unwind(AssertUnwindSafe(action))
            .map_err(|payload| TwainError::threading(panic_message(payload)))
    }

    fn begin_invoke(&self, action: Action) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
            log::warn!("posted action failed: {}", panic_message(payload));
        }
    }
}

enum LoopMsg {
    Run {
        action: Action,
        done: Option<Sender<std::result::Result<(), String>>>,
    },
}

struct LoopInner {
    tx: Sender<LoopMsg>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// A dispatcher loop pumped on a dedicated named thread.
///
/// The platform-neutral equivalent of a native message loop: the
/// session runs one internally for the manager's callbacks, and
/// callers can run their own as an external context. `invoke` from the
/// loop's own thread runs the action inline rather than deadlocking on
/// the rendezvous.
pub struct DispatcherLoop {
    name: String,
    inner: Mutex<Option<LoopInner>>,
}

impl DispatcherLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().expect("lock poisoned").is_some()
    }

    fn pump(rx: Receiver<LoopMsg>) {
        for msg in rx.iter() {
            match msg {
                LoopMsg::Run { action, done } => {
                    let outcome = catch_unwind(AssertUnwindSafe(action)).map_err(panic_message);
                    match done {
                        Some(done) => {
                            let _ = done.send(outcome);
                        }
                        None => {
                            if let Err(message) = outcome {
                                log::warn!("posted action failed: {message}");
                            }
                        }
                    }
                }
            }
        }
    }
}

impl ThreadContext for DispatcherLoop {
    fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.is_some() {
            return Ok(());
        }

        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || Self::pump(rx))
            .map_err(|e| TwainError::threading(format!("spawn failed: {e}")))?;
        let thread_id = handle.thread().id();

        *inner = Some(LoopInner {
            tx,
            handle,
            thread_id,
        });
        log::debug!("dispatcher loop {:?} started", self.name);
        Ok(())
    }

    fn stop(&self) {
        let taken = self.inner.lock().expect("lock poisoned").take();
        if let Some(LoopInner {
            tx,
            handle,
            thread_id,
        }) = taken
        {
            // Dropping the sender disconnects the channel; the pump
            // drains what was already queued and exits.
            drop(tx);
            if thread::current().id() != thread_id {
                let _ = handle.join();
            }
            log::debug!("dispatcher loop {:?} stopped", self.name);
        }
    }

    fn invoke(&self, action: Action) -> Result<()> {
        let (tx, thread_id) = {
            let inner = self.inner.lock().expect("lock poisoned");
            match inner.as_ref() {
                Some(inner) => (inner.tx.clone(), inner.thread_id),
                None => return Err(TwainError::threading("context is not running")),
            }
        };

        // Re-entrant invoke from the loop thread itself.
        if thread::current().id() == thread_id {
            return catch_unwind(AssertUnwindSafe(action))
                .map_err(|payload| TwainError::threading(panic_message(payload)));
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        tx.send(LoopMsg::Run {
            action,
            done: Some(done_tx),
        })
        .map_err(|_| TwainError::threading("context stopped while posting"))?;

        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(TwainError::threading(message)),
            Err(_) => Err(TwainError::threading("context stopped mid-action")),
        }
    }

    fn begin_invoke(&self, action: Action) {
        let tx = {
            let inner = self.inner.lock().expect("lock poisoned");
            inner.as_ref().map(|inner| inner.tx.clone())
        };
        match tx {
            Some(tx) => {
                if tx.send(LoopMsg::Run { action, done: None }).is_err() {
                    log::debug!("dropped posted action: context stopped");
                }
            }
            None => log::debug!("dropped posted action: context not running"),
        }
    }
}

impl Drop for DispatcherLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DispatcherLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn invoke_runs_on_the_loop_thread() {
        let ctx = DispatcherLoop::new("test-loop");
        ctx.start().unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        ctx.invoke(Box::new(move || {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        }))
        .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("test-loop"));
        ctx.stop();
    }

    #[test]
    fn invoke_surfaces_panics_as_threading_errors() {
        let ctx = DispatcherLoop::new("test-panic");
        ctx.start().unwrap();

        let err = ctx
            .invoke(Box::new(|| panic!("deliberate")))
            .unwrap_err();
        assert!(matches!(err, TwainError::Threading(m) if m.contains("deliberate")));
        ctx.stop();
    }

    #[test]
    fn begin_invoke_swallows_panics() {
        let ctx = DispatcherLoop::new("test-swallow");
        ctx.start().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        ctx.begin_invoke(Box::new(|| panic!("ignored")));
        let ran2 = ran.clone();
        ctx.invoke(Box::new(move || ran2.store(true, Ordering::SeqCst)))
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        ctx.stop();
    }

    #[test]
    fn invoke_on_stopped_context_errors() {
        let ctx = DispatcherLoop::new("test-stopped");
        let err = ctx.invoke(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, TwainError::Threading(_)));
    }

    #[test]
    fn actions_preserve_posting_order() {
        let ctx = DispatcherLoop::new("test-order");
        ctx.start().unwrap();

        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            ctx.begin_invoke(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        ctx.invoke(Box::new(|| {})).unwrap();

        let seen: Vec<i32> = rx.try_iter().collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        ctx.stop();
    }

    #[test]
    fn inline_context_propagates_failures() {
        let ctx = InlineContext;
        assert!(ctx.invoke(Box::new(|| {})).is_ok());
        assert!(ctx.invoke(Box::new(|| panic!("nope"))).is_err());
    }
}
