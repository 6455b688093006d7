//! Asynchronous request engine
//!
//! Every I/O operation in this crate is a [`Request`]: a one-shot completion
//! object that owns the operation's private state, moves through exactly one
//! terminal transition and then invokes its continuation exactly once.
//!
//! An operation is written as a pair of free functions. `*_send` creates the
//! request, registers interest with the [`Scheduler`] and returns immediately;
//! `*_recv` is called from the continuation and extracts the result. Sub-steps
//! are chained by creating sub-requests inside `*_send` or inside a
//! continuation, storing them in the parent's private state, and registering a
//! continuation that only holds a [`WeakRequest`] to the parent.
//!
//! ```no_run
//! use rust_smb_async::async_req::{wakeup_recv, wakeup_send, Scheduler};
//! use std::time::Duration;
//!
//! let sched = Scheduler::new()?;
//! let req = wakeup_send(&sched, sched.now() + Duration::from_millis(5))?;
//! req.set_continuation(|req| {
//!     let _ = wakeup_recv(req);
//! });
//! sched.wait(&req);
//! # Ok::<(), rust_smb_async::Error>(())
//! ```

pub mod scheduler;
pub mod wakeup;

pub use scheduler::{FdHandler, FdInterest, Scheduler, TimerHandle, WatchHandle};
pub use wakeup::{wakeup_recv, wakeup_send, WakeupState};

use crate::error::{Error, NtStatus, Result};
use std::any::type_name;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::io;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, trace, warn};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a request. Everything but `InProgress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    InProgress,
    Done,
    UserError(NtStatus),
    TimedOut,
    NoMemory,
}

impl ReqState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReqState::InProgress)
    }

    /// Map the state to the caller-facing result
    pub fn into_result(self) -> Result<()> {
        match self {
            ReqState::InProgress => Err(Error::InvalidState(
                "request is still in progress".to_string(),
            )),
            ReqState::Done => Ok(()),
            ReqState::UserError(status) => Err(status.into()),
            ReqState::TimedOut => Err(Error::Timeout),
            ReqState::NoMemory => Err(Error::NoMemory),
        }
    }
}

impl fmt::Display for ReqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqState::InProgress => write!(f, "in progress"),
            ReqState::Done => write!(f, "done"),
            ReqState::UserError(_) => write!(f, "user error"),
            ReqState::TimedOut => write!(f, "timed out"),
            ReqState::NoMemory => write!(f, "no memory"),
        }
    }
}

/// Completion callback. Receives the finished request so it can call `*_recv`.
pub type Continuation<S> = Box<dyn FnOnce(&Request<S>)>;

struct Core<S> {
    state: ReqState,
    continuation: Option<Continuation<S>>,
    delivered: bool,
    timeout: Option<TimerHandle>,
    trigger: Option<TimerHandle>,
}

struct Shared<S> {
    id: u64,
    location: &'static Location<'static>,
    scheduler: Scheduler,
    finished: Notify,
    core: RefCell<Core<S>>,
    data: RefCell<S>,
}

/// An in-flight asynchronous operation with private state `S`.
///
/// The value returned by a `*_send` function is the owning handle: dropping it
/// destroys the private state, cancels the timeout and trigger timers, and stops
/// any further dispatch into the operation. Handles obtained through
/// [`WeakRequest::upgrade`] or passed to a continuation are transient views and
/// must not be stored.
pub struct Request<S> {
    inner: Rc<Shared<S>>,
}

/// Non-owning reference to a request, for use as continuation context
pub struct WeakRequest<S> {
    inner: Weak<Shared<S>>,
}

impl<S> WeakRequest<S> {
    /// Get a transient handle if the request still exists
    pub fn upgrade(&self) -> Option<Request<S>> {
        self.inner.upgrade().map(|inner| Request { inner })
    }
}

impl<S> Clone for WeakRequest<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S: 'static> Request<S> {
    /// Create a request in the `InProgress` state owning `data`
    #[track_caller]
    pub fn new(scheduler: &Scheduler, data: S) -> Self {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let location = Location::caller();
        trace!("creating request #{} ({}) at {}", id, type_name::<S>(), location);
        Self {
            inner: Rc::new(Shared {
                id,
                location,
                scheduler: scheduler.clone(),
                finished: Notify::new(),
                core: RefCell::new(Core {
                    state: ReqState::InProgress,
                    continuation: None,
                    delivered: false,
                    timeout: None,
                    trigger: None,
                }),
                data: RefCell::new(data),
            }),
        }
    }

    /// Unique id, for log correlation
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The scheduler this request was created against
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Weak reference for continuation and callback context
    pub fn downgrade(&self) -> WeakRequest<S> {
        WeakRequest {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Borrow the private state
    pub fn data(&self) -> Ref<'_, S> {
        self.inner.data.borrow()
    }

    /// Mutably borrow the private state.
    ///
    /// The borrow must be released before calling `done`, `fail` or any other
    /// method that can run the continuation.
    pub fn data_mut(&self) -> RefMut<'_, S> {
        self.inner.data.borrow_mut()
    }

    /// Current state
    pub fn state(&self) -> ReqState {
        self.inner.core.borrow().state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() == ReqState::InProgress
    }

    /// The terminal error state, or `None` while in progress or after success
    pub fn peek_error(&self) -> Option<ReqState> {
        match self.state() {
            ReqState::InProgress | ReqState::Done => None,
            other => Some(other),
        }
    }

    /// Result of the request as seen by a `*_recv` function
    pub fn status(&self) -> Result<()> {
        self.state().into_result()
    }

    fn finish(&self, state: ReqState) {
        let stale_timer = {
            let mut core = self.inner.core.borrow_mut();
            if core.state.is_terminal() {
                trace!(
                    "request #{} already {}, ignoring {}",
                    self.inner.id,
                    core.state,
                    state
                );
                return;
            }
            core.state = state;
            core.timeout.take()
        };
        drop(stale_timer);
        trace!("request #{} finished: {}", self.inner.id, state);
        self.inner.finished.notify_waiters();
        self.deliver();
    }

    fn deliver(&self) {
        let continuation = {
            let mut core = self.inner.core.borrow_mut();
            if !core.state.is_terminal() || core.delivered {
                return;
            }
            let continuation = core.continuation.take();
            if continuation.is_some() {
                core.delivered = true;
            }
            continuation
        };
        if let Some(continuation) = continuation {
            continuation(self);
        }
    }

    /// The operation finished successfully
    pub fn done(&self) {
        self.finish(ReqState::Done);
    }

    /// The operation failed with `status`.
    ///
    /// Returns false without touching the request when `status` is success, so
    /// callers can write `if req.fail(status) { return; }`.
    pub fn fail(&self, status: NtStatus) -> bool {
        if status.is_success() {
            return false;
        }
        self.finish(ReqState::UserError(status));
        true
    }

    /// Fail with the status mapped from an OS error. Always returns true.
    pub fn fail_io(&self, err: &io::Error) -> bool {
        let status = match NtStatus::from_io_error(err) {
            NtStatus::Success => NtStatus::Unsuccessful,
            status => status,
        };
        self.fail(status)
    }

    /// Pass `value` through; on `None` move the request to `NoMemory`.
    ///
    /// Used after every step that can fail to allocate or register:
    /// `let Some(sub) = req.fail_if_none(sub) else { return };`
    pub fn fail_if_none<T>(&self, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.finish(ReqState::NoMemory);
        }
        value
    }

    /// Map a lower layer's error into this request's own terminal state
    pub fn forward(&self, err: &Error) {
        match err {
            Error::Timeout => self.finish(ReqState::TimedOut),
            Error::NoMemory => self.finish(ReqState::NoMemory),
            other => {
                let status = match other.status() {
                    NtStatus::Success => NtStatus::Unsuccessful,
                    status => status,
                };
                self.fail(status);
            }
        }
    }

    fn arm_trigger(&self) -> Result<TimerHandle> {
        let weak = self.downgrade();
        self.inner.scheduler.add_timer(self.inner.scheduler.now(), move || {
            if let Some(req) = weak.upgrade() {
                let fired = req.inner.core.borrow_mut().trigger.take();
                drop(fired);
                req.deliver();
            }
        })
    }

    /// Defer delivery of an outcome decided inside the constructor.
    ///
    /// Arms a zero-delay timer that delivers whatever state the request is in
    /// when it fires, so the caller always gets a loop turn to register its
    /// continuation. If the timer cannot be armed the request is destroyed and
    /// the error is returned.
    pub fn post(self) -> Result<Self> {
        let trigger = self.arm_trigger()?;
        self.inner.core.borrow_mut().trigger = Some(trigger);
        Ok(self)
    }

    /// Register the continuation. It fires at most once, and never from inside
    /// this call: for an already terminal request it runs on the next turn.
    ///
    /// Returns false and drops `continuation` when it can never run: the
    /// request was already delivered, or it is terminal and the scheduler
    /// refuses the timer that would deliver it.
    pub fn set_continuation<F>(&self, continuation: F) -> bool
    where
        F: FnOnce(&Request<S>) + 'static,
    {
        let mut core = self.inner.core.borrow_mut();
        if core.delivered {
            warn!(
                "request #{} already delivered, dropping continuation",
                self.inner.id
            );
            return false;
        }
        core.continuation = Some(Box::new(continuation));
        if !core.state.is_terminal() || core.trigger.is_some() {
            return true;
        }
        drop(core);
        match self.arm_trigger() {
            Ok(trigger) => {
                self.inner.core.borrow_mut().trigger = Some(trigger);
                true
            }
            Err(err) => {
                error!(
                    "request #{} cannot schedule delivery: {}",
                    self.inner.id, err
                );
                let lost = self.inner.core.borrow_mut().continuation.take();
                drop(lost);
                false
            }
        }
    }

    /// Move to `TimedOut` if still in progress at `deadline`.
    ///
    /// Replaces any earlier timeout. Returns false and leaves the request as it
    /// was if the timer cannot be scheduled.
    pub fn set_timeout(&self, deadline: Instant) -> bool {
        let weak = self.downgrade();
        let timer = self.inner.scheduler.add_timer(deadline, move || {
            if let Some(req) = weak.upgrade() {
                let fired = req.inner.core.borrow_mut().timeout.take();
                drop(fired);
                req.finish(ReqState::TimedOut);
            }
        });
        match timer {
            Ok(timer) => {
                let previous = self.inner.core.borrow_mut().timeout.replace(timer);
                drop(previous);
                true
            }
            Err(err) => {
                warn!("request #{} cannot arm timeout: {}", self.inner.id, err);
                false
            }
        }
    }

    /// [`set_timeout`](Self::set_timeout) relative to the scheduler's clock
    pub fn set_timeout_after(&self, after: Duration) -> bool {
        self.set_timeout(self.inner.scheduler.now() + after)
    }

    /// Resolve once the request is terminal. Any number of tasks may wait on
    /// the same request; all of them are woken.
    pub async fn wait(&self) {
        while self.is_in_progress() {
            self.inner.finished.notified().await;
        }
    }

    /// One-line diagnostic rendering
    pub fn describe(&self) -> String {
        let (state, timeout, trigger) = match self.inner.core.try_borrow() {
            Ok(core) => (
                core.state.to_string(),
                core.timeout.is_some(),
                core.trigger.is_some(),
            ),
            Err(_) => ("<busy>".to_string(), false, false),
        };
        let error = match self.inner.core.try_borrow().map(|core| core.state) {
            Ok(ReqState::UserError(status)) => status.to_string(),
            _ => "none".to_string(),
        };
        format!(
            "Request[#{} {} at {}]: state[{}] error[{}] timeout[{}] trigger[{}]",
            self.inner.id,
            type_name::<S>(),
            self.inner.location,
            state,
            error,
            if timeout { "armed" } else { "none" },
            if trigger { "armed" } else { "none" },
        )
    }
}

impl<S: 'static> fmt::Debug for Request<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests;
