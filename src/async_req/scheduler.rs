//! Single-threaded event loop driving every request
//!
//! The scheduler is a tokio current-thread runtime plus a `LocalSet`. It hands out
//! two kinds of registrations: one-shot timers and descriptor watches. Dropping
//! the returned handle deregisters it, which is how a request cancels whatever it
//! is waiting on when it is destroyed.

use crate::async_req::Request;
use crate::error::{Error, Result};
use bitflags::bitflags;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, LocalSet};
use tokio::time::Instant;
use tracing::{trace, warn};

bitflags! {
    /// Readiness a descriptor watch is interested in
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdInterest: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
    }
}

/// Descriptor handler. Returning `ErrorKind::WouldBlock` clears the cached
/// readiness so the next wakeup waits for the kernel again.
pub type FdHandler = Box<dyn FnMut(FdInterest) -> io::Result<()>>;

/// A pending one-shot timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A registered descriptor watch. Dropping it stops dispatch into the handler.
pub struct WatchHandle {
    fd: RawFd,
    interest: FdInterest,
    task: AbortHandle,
    live: Rc<Cell<bool>>,
    owner: Weak<Inner>,
}

impl WatchHandle {
    /// The watched descriptor
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("live", &self.live.get())
            .finish()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.live.set(false);
        self.task.abort();
        if let Some(inner) = self.owner.upgrade() {
            inner.release(self.fd, self.interest);
        }
    }
}

/// Non-owning view of a descriptor for readiness registration
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// One reactor registration per descriptor, shared by all of its watches.
///
/// Only `anchor` keeps it alive between dispatches, so the descriptor leaves
/// the reactor as soon as its last watch is dropped. A dispatch in progress
/// holds it briefly; a watch registered during that window revives it.
struct Registration {
    async_fd: Weak<AsyncFd<WatchedFd>>,
    anchor: Option<Rc<AsyncFd<WatchedFd>>>,
    readers: usize,
    writers: usize,
}

impl Registration {
    fn conflicts(&self, interest: FdInterest) -> bool {
        (interest.contains(FdInterest::READ) && self.readers > 0)
            || (interest.contains(FdInterest::WRITE) && self.writers > 0)
    }

    fn add(&mut self, interest: FdInterest) {
        if interest.contains(FdInterest::READ) {
            self.readers += 1;
        }
        if interest.contains(FdInterest::WRITE) {
            self.writers += 1;
        }
    }

    fn remove(&mut self, interest: FdInterest) {
        if interest.contains(FdInterest::READ) {
            self.readers = self.readers.saturating_sub(1);
        }
        if interest.contains(FdInterest::WRITE) {
            self.writers = self.writers.saturating_sub(1);
        }
    }

    fn is_unwatched(&self) -> bool {
        self.readers == 0 && self.writers == 0
    }
}

/// Counts a spawned timer or watch task until its future is dropped
struct TaskGuard {
    owner: Weak<Inner>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            let left = inner.tasks.get().saturating_sub(1);
            inner.tasks.set(left);
            if left == 0 {
                inner.idle.notify_waiters();
            }
        }
    }
}

struct Inner {
    // Dropped before the runtime so pending tasks and registrations are released
    // while the reactor still exists.
    local: LocalSet,
    fds: RefCell<HashMap<RawFd, Registration>>,
    runtime: Runtime,
    closed: Cell<bool>,
    tasks: Cell<usize>,
    idle: Notify,
}

impl Inner {
    fn release(&self, fd: RawFd, interest: FdInterest) {
        let released = {
            let mut fds = self.fds.borrow_mut();
            match fds.get_mut(&fd) {
                Some(registration) => {
                    registration.remove(interest);
                    if registration.is_unwatched() {
                        registration.anchor.take()
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if released.is_some() {
            trace!("fd {} has no watches left", fd);
        }
    }
}

fn poll_dispatch(
    registration: &Weak<AsyncFd<WatchedFd>>,
    interest: FdInterest,
    handler: &mut FdHandler,
    cx: &mut Context<'_>,
) -> Poll<bool> {
    let Some(async_fd) = registration.upgrade() else {
        return Poll::Ready(false);
    };
    if interest.contains(FdInterest::READ) {
        match async_fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                if guard.try_io(|_| handler(FdInterest::READ)).is_err() {
                    trace!("fd {} would block on read", async_fd.get_ref().0);
                }
                return Poll::Ready(true);
            }
            Poll::Ready(Err(err)) => {
                warn!("read readiness on fd {} failed: {}", async_fd.get_ref().0, err);
                return Poll::Ready(false);
            }
            Poll::Pending => {}
        }
    }
    if interest.contains(FdInterest::WRITE) {
        match async_fd.poll_write_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                if guard.try_io(|_| handler(FdInterest::WRITE)).is_err() {
                    trace!("fd {} would block on write", async_fd.get_ref().0);
                }
                return Poll::Ready(true);
            }
            Poll::Ready(Err(err)) => {
                warn!("write readiness on fd {} failed: {}", async_fd.get_ref().0, err);
                return Poll::Ready(false);
            }
            Poll::Pending => {}
        }
    }
    Poll::Pending
}

/// The event context every request is created against
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Create a new scheduler with its own current-thread runtime
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self::with_runtime(runtime))
    }

    /// Scheduler whose clock only moves when the loop is idle
    #[cfg(test)]
    pub(crate) fn with_paused_clock() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()?;
        Ok(Self::with_runtime(runtime))
    }

    fn with_runtime(runtime: Runtime) -> Self {
        Self {
            inner: Rc::new(Inner {
                local: LocalSet::new(),
                fds: RefCell::new(HashMap::new()),
                runtime,
                closed: Cell::new(false),
                tasks: Cell::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Current time on the scheduler's clock
    pub fn now(&self) -> Instant {
        let _enter = self.inner.runtime.enter();
        Instant::now()
    }

    /// Schedule `callback` to run once `deadline` has passed.
    ///
    /// The callback never runs inside this call, even for a deadline in the past;
    /// the earliest it can run is the next loop turn.
    pub fn add_timer<F>(&self, deadline: Instant, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() + 'static,
    {
        self.check_open()?;
        let guard = self.task_guard();
        let join = self.inner.local.spawn_local(async move {
            let _guard = guard;
            if deadline > Instant::now() {
                tokio::time::sleep_until(deadline).await;
            }
            callback();
        });
        Ok(TimerHandle {
            task: join.abort_handle(),
        })
    }

    /// Watch `fd` for readiness and call `handler` each time it is ready.
    ///
    /// The descriptor is borrowed: the caller keeps it open for as long as the
    /// returned handle lives. Several watches on one descriptor share a single
    /// reactor registration, with at most one watch per direction at a time: a
    /// second read or write watch on a descriptor fails with
    /// [`Error::InvalidState`] until the first is dropped.
    pub fn watch_fd<F>(&self, fd: RawFd, interest: FdInterest, handler: F) -> Result<WatchHandle>
    where
        F: FnMut(FdInterest) -> io::Result<()> + 'static,
    {
        self.check_open()?;
        if interest.is_empty() {
            return Err(Error::InvalidParameter(
                "descriptor watch without any interest".to_string(),
            ));
        }
        let registration = self.register(fd, interest)?;
        let live = Rc::new(Cell::new(true));
        let task_live = Rc::clone(&live);
        let mut handler: FdHandler = Box::new(handler);

        let guard = self.task_guard();
        let join = self.inner.local.spawn_local(async move {
            let _guard = guard;
            while task_live.get() {
                let more = poll_fn(|cx| poll_dispatch(&registration, interest, &mut handler, cx)).await;
                if !more {
                    break;
                }
            }
        });

        Ok(WatchHandle {
            fd,
            interest,
            task: join.abort_handle(),
            live,
            owner: Rc::downgrade(&self.inner),
        })
    }

    fn task_guard(&self) -> TaskGuard {
        self.inner.tasks.set(self.inner.tasks.get() + 1);
        TaskGuard {
            owner: Rc::downgrade(&self.inner),
        }
    }

    fn register(&self, fd: RawFd, interest: FdInterest) -> Result<Weak<AsyncFd<WatchedFd>>> {
        let mut fds = self.inner.fds.borrow_mut();
        if let Some(existing) = fds.get_mut(&fd) {
            if let Some(async_fd) = existing.async_fd.upgrade() {
                if existing.conflicts(interest) {
                    return Err(Error::InvalidState(format!(
                        "fd {} already has a {:?} watch",
                        fd, interest
                    )));
                }
                existing.add(interest);
                existing.anchor.get_or_insert(async_fd);
                return Ok(Weak::clone(&existing.async_fd));
            }
        }
        fds.retain(|_, registration| registration.async_fd.strong_count() > 0);

        let _enter = self.inner.runtime.enter();
        let async_fd = Rc::new(AsyncFd::with_interest(
            WatchedFd(fd),
            Interest::READABLE | Interest::WRITABLE,
        )?);
        let weak = Rc::downgrade(&async_fd);
        let mut registration = Registration {
            async_fd: Weak::clone(&weak),
            anchor: Some(async_fd),
            readers: 0,
            writers: 0,
        };
        registration.add(interest);
        fds.insert(fd, registration);
        trace!("fd {} joined the reactor", fd);
        Ok(weak)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::InvalidState("scheduler is shut down".to_string()));
        }
        Ok(())
    }

    /// Refuse any further timer or descriptor registration
    pub fn shutdown(&self) {
        self.inner.closed.set(true);
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.get()
    }

    /// Drive the loop until `future` completes.
    ///
    /// Must not be called from inside a callback the loop is already running.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.local.block_on(&self.inner.runtime, future)
    }

    /// Run the loop until `req` has reached a terminal state.
    ///
    /// Returns false, leaving `req` in progress, once no timer or descriptor
    /// watch is left that could still finish it.
    pub fn wait<S: 'static>(&self, req: &Request<S>) -> bool {
        self.block_on(async {
            loop {
                if !req.is_in_progress() {
                    return true;
                }
                if self.inner.tasks.get() == 0 {
                    warn!("request #{} can no longer make progress", req.id());
                    return false;
                }
                let idle = self.inner.idle.notified();
                tokio::select! {
                    _ = req.wait() => {}
                    _ = idle => {}
                }
            }
        })
    }

    /// Run a single loop iteration, dispatching whatever is ready right now
    pub fn turn(&self) {
        self.block_on(tokio::task::yield_now());
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("watched_fds", &self.inner.fds.borrow().len())
            .field("tasks", &self.inner.tasks.get())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}
