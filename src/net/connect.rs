//! Outbound TCP connect with exponential backoff
//!
//! A connect request owns a non-blocking socket and keeps calling `connect()`
//! on it. Transient results (`EINPROGRESS`, `EALREADY`, `EAGAIN`, `ETIMEDOUT`)
//! schedule another attempt after a growing wait; `EISCONN` or success finish
//! the request. The overall deadline is the request timeout, so a slow peer
//! ends in `TimedOut` rather than a user error.
//!
//! The socket belongs to the request until [`connect_recv`] hands it out.
//! Dropping the request earlier closes it.

use crate::async_req::{wakeup_recv, wakeup_send, Request, Scheduler, WakeupState};
use crate::config::{ConnectConfig, SocketOptions};
use crate::error::{Error, NtStatus, Result};
use crate::net::addr;
use nix::errno::Errno;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Growing wait between connect attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            multiplier,
            max,
        }
    }

    /// The wait before the next attempt. Each call grows the following one by
    /// the multiplier, never beyond the cap.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        let grown = (self.current.as_nanos() as f64 * self.multiplier).round();
        self.current = if grown >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(grown as u64)
        };
        wait
    }
}

impl Default for Backoff {
    fn default() -> Self {
        ConnectConfig::default().backoff()
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_wait())
    }
}

/// The two OS primitives a connect request needs
pub trait Connector {
    /// Create a non-blocking stream socket for `addr`'s family
    fn open(&self, addr: &SocketAddr) -> io::Result<Socket>;

    /// One `connect()` call; transient errors are returned as-is
    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()>;
}

/// Real sockets through socket2
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn open(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn connect(&self, socket: &Socket, addr: &SockAddr) -> io::Result<()> {
        socket.connect(addr)
    }
}

/// Private state of [`connect_send`]
pub struct ConnectState {
    socket: Option<Socket>,
    target: SocketAddr,
    sockaddr: SockAddr,
    backoff: Backoff,
    connector: Rc<dyn Connector>,
    options: SocketOptions,
    retry: Option<Request<WakeupState>>,
    attempts: u32,
}

impl ConnectState {
    /// Number of `connect()` calls made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The address being connected to, after scope fix-up
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Drop for ConnectState {
    fn drop(&mut self) {
        if self.socket.is_some() {
            debug!("closing unconnected socket for {}", self.target);
        }
    }
}

enum Step {
    Connected,
    Retry(Duration),
    Failed(Error),
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_i32),
        Some(Errno::EINPROGRESS | Errno::EALREADY | Errno::EAGAIN | Errno::ETIMEDOUT)
    )
}

fn is_connected(err: &io::Error) -> bool {
    err.raw_os_error().map(Errno::from_i32) == Some(Errno::EISCONN)
}

/// Connect to `addr` with the system connector
pub fn connect_send(
    sched: &Scheduler,
    addr: SocketAddr,
    config: &ConnectConfig,
) -> Result<Request<ConnectState>> {
    connect_send_with(sched, addr, config, Rc::new(SystemConnector))
}

/// Connect to `addr` through `connector`
pub fn connect_send_with(
    sched: &Scheduler,
    addr: SocketAddr,
    config: &ConnectConfig,
    connector: Rc<dyn Connector>,
) -> Result<Request<ConnectState>> {
    let target = addr::scoped(addr);
    let opened = connector.open(&target);
    let req = Request::new(
        sched,
        ConnectState {
            socket: None,
            target,
            sockaddr: SockAddr::from(target),
            backoff: config.backoff(),
            connector,
            options: config.socket_options.clone(),
            retry: None,
            attempts: 0,
        },
    );

    match opened {
        Ok(socket) => req.data_mut().socket = Some(socket),
        Err(err) => {
            warn!("cannot create socket for {}: {}", target, err);
            req.fail_io(&err);
            return req.post();
        }
    }

    if !req.set_timeout_after(config.timeout) {
        return Err(Error::NoMemory);
    }

    debug!("connecting to {}", target);
    advance(&req);
    if req.is_in_progress() {
        Ok(req)
    } else {
        req.post()
    }
}

fn attempt(req: &Request<ConnectState>) -> Step {
    let mut guard = req.data_mut();
    let state = &mut *guard;
    state.attempts += 1;
    let Some(socket) = state.socket.as_ref() else {
        return Step::Failed(Error::InvalidState("connect socket already taken".to_string()));
    };
    match state.connector.connect(socket, &state.sockaddr) {
        Ok(()) => {}
        Err(err) if is_connected(&err) => {}
        Err(err) if is_transient(&err) => {
            let wait = state.backoff.next_wait();
            trace!(
                "connect to {} in progress (attempt {}), next try in {:?}",
                state.target,
                state.attempts,
                wait
            );
            return Step::Retry(wait);
        }
        Err(err) => return Step::Failed(err.into()),
    }
    match state.options.apply(socket) {
        Ok(()) => Step::Connected,
        Err(err) => Step::Failed(err),
    }
}

fn advance(req: &Request<ConnectState>) {
    match attempt(req) {
        Step::Connected => {
            debug!(
                "connected to {} after {} attempt(s)",
                req.data().target,
                req.data().attempts
            );
            req.done();
        }
        Step::Retry(wait) => schedule_retry(req, wait),
        Step::Failed(err) => {
            debug!("connect to {} failed: {}", req.data().target, err);
            req.forward(&err);
        }
    }
}

fn schedule_retry(req: &Request<ConnectState>, wait: Duration) {
    let deadline = req.scheduler().now() + wait;
    let Some(retry) = req.fail_if_none(wakeup_send(req.scheduler(), deadline).ok()) else {
        return;
    };
    let weak = req.downgrade();
    retry.set_continuation(move |sub| {
        let waited = wakeup_recv(sub);
        let Some(req) = weak.upgrade() else {
            return;
        };
        if !req.is_in_progress() {
            trace!("request #{} already finished, dropping retry", req.id());
            return;
        }
        let finished = req.data_mut().retry.take();
        drop(finished);
        match waited {
            Ok(()) => advance(&req),
            Err(err) => req.forward(&err),
        }
    });
    req.data_mut().retry = Some(retry);
}

/// Hand out the connected socket. It stays in non-blocking mode.
pub fn connect_recv(req: &Request<ConnectState>) -> Result<Socket> {
    req.status()?;
    req.data_mut()
        .socket
        .take()
        .ok_or_else(|| Error::InvalidState("connected socket already taken".to_string()))
}

/// Connect synchronously on a private scheduler
pub fn connect_blocking(addr: SocketAddr, config: &ConnectConfig) -> Result<Socket> {
    let sched = Scheduler::new()?;
    let req = connect_send(&sched, addr, config)?;
    sched.wait(&req);
    connect_recv(&req)
}

/// Private state of [`connect_defer_send`]
pub struct ConnectDeferState {
    target: SocketAddr,
    config: ConnectConfig,
    connector: Rc<dyn Connector>,
    delay: Option<Request<WakeupState>>,
    connect: Option<Request<ConnectState>>,
    socket: Option<Socket>,
}

impl ConnectDeferState {
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Wait `delay`, then start a [`connect_send`] to `addr`
pub fn connect_defer_send(
    sched: &Scheduler,
    delay: Duration,
    addr: SocketAddr,
    config: &ConnectConfig,
) -> Result<Request<ConnectDeferState>> {
    connect_defer_send_with(sched, delay, addr, config, Rc::new(SystemConnector))
}

pub fn connect_defer_send_with(
    sched: &Scheduler,
    delay: Duration,
    addr: SocketAddr,
    config: &ConnectConfig,
    connector: Rc<dyn Connector>,
) -> Result<Request<ConnectDeferState>> {
    let req = Request::new(
        sched,
        ConnectDeferState {
            target: addr,
            config: config.clone(),
            connector,
            delay: None,
            connect: None,
            socket: None,
        },
    );
    let delay = wakeup_send(sched, sched.now() + delay)?;
    let weak = req.downgrade();
    delay.set_continuation(move |sub| {
        let waited = wakeup_recv(sub);
        if let Some(req) = weak.upgrade() {
            connect_defer_waited(&req, waited);
        }
    });
    req.data_mut().delay = Some(delay);
    Ok(req)
}

fn connect_defer_waited(req: &Request<ConnectDeferState>, waited: Result<()>) {
    let finished = req.data_mut().delay.take();
    drop(finished);
    if let Err(err) = waited {
        req.forward(&err);
        return;
    }

    let started = {
        let state = req.data();
        connect_send_with(
            req.scheduler(),
            state.target,
            &state.config,
            Rc::clone(&state.connector),
        )
    };
    let Some(connect) = req.fail_if_none(started.ok()) else {
        return;
    };
    let weak = req.downgrade();
    connect.set_continuation(move |sub| {
        let connected = connect_recv(sub);
        let Some(req) = weak.upgrade() else {
            return;
        };
        let finished = req.data_mut().connect.take();
        drop(finished);
        match connected {
            Ok(socket) => {
                req.data_mut().socket = Some(socket);
                req.done();
            }
            Err(err) => req.forward(&err),
        }
    });
    req.data_mut().connect = Some(connect);
}

pub fn connect_defer_recv(req: &Request<ConnectDeferState>) -> Result<Socket> {
    req.status()?;
    req.data_mut()
        .socket
        .take()
        .ok_or_else(|| Error::InvalidState("connected socket already taken".to_string()))
}

/// Private state of [`connect_any_send`]
pub struct ConnectAnyState {
    candidates: Vec<Option<Request<ConnectDeferState>>>,
    pending: usize,
    last_error: Option<Error>,
    winner: Option<(usize, Socket)>,
}

/// Race connects to every address in `addrs`; the first to connect wins and
/// the others are abandoned.
///
/// With a non-zero `config.stagger` candidate `i` starts `i * stagger` after
/// the first one. If every candidate fails the last error is reported.
pub fn connect_any_send(
    sched: &Scheduler,
    addrs: &[SocketAddr],
    config: &ConnectConfig,
) -> Result<Request<ConnectAnyState>> {
    connect_any_send_with(sched, addrs, config, Rc::new(SystemConnector))
}

pub fn connect_any_send_with(
    sched: &Scheduler,
    addrs: &[SocketAddr],
    config: &ConnectConfig,
    connector: Rc<dyn Connector>,
) -> Result<Request<ConnectAnyState>> {
    let req = Request::new(
        sched,
        ConnectAnyState {
            candidates: Vec::with_capacity(addrs.len()),
            pending: 0,
            last_error: None,
            winner: None,
        },
    );
    if addrs.is_empty() {
        req.fail(NtStatus::InvalidParameter);
        return req.post();
    }

    let mut delay = Duration::ZERO;
    for (index, addr) in addrs.iter().enumerate() {
        match connect_defer_send_with(sched, delay, *addr, config, Rc::clone(&connector)) {
            Ok(candidate) => {
                let weak = req.downgrade();
                candidate.set_continuation(move |sub| {
                    let connected = connect_defer_recv(sub);
                    if let Some(req) = weak.upgrade() {
                        connect_any_settled(&req, index, connected);
                    }
                });
                let mut state = req.data_mut();
                state.candidates.push(Some(candidate));
                state.pending += 1;
            }
            Err(err) => {
                warn!("cannot start connect to {}: {}", addr, err);
                let mut state = req.data_mut();
                state.candidates.push(None);
                state.last_error = Some(err);
            }
        }
        delay += config.stagger;
    }

    if req.data().pending == 0 {
        let err = req.data_mut().last_error.take();
        req.forward(&err.unwrap_or(Error::NoMemory));
        return req.post();
    }
    Ok(req)
}

fn connect_any_settled(req: &Request<ConnectAnyState>, index: usize, connected: Result<Socket>) {
    if !req.is_in_progress() {
        return;
    }
    let finished = req.data_mut().candidates[index].take();
    drop(finished);

    match connected {
        Ok(socket) => {
            let losers = {
                let mut state = req.data_mut();
                state.winner = Some((index, socket));
                std::mem::take(&mut state.candidates)
            };
            debug!("candidate {} connected first", index);
            drop(losers);
            req.done();
        }
        Err(err) => {
            trace!("candidate {} failed: {}", index, err);
            let exhausted = {
                let mut state = req.data_mut();
                state.pending -= 1;
                state.last_error = Some(err);
                state.pending == 0
            };
            if exhausted {
                let err = req.data_mut().last_error.take();
                req.forward(&err.unwrap_or(Error::NoMemory));
            }
        }
    }
}

/// The index of the winning address and its connected socket
pub fn connect_any_recv(req: &Request<ConnectAnyState>) -> Result<(usize, Socket)> {
    req.status()?;
    req.data_mut()
        .winner
        .take()
        .ok_or_else(|| Error::InvalidState("connected socket already taken".to_string()))
}
