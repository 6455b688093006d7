//! A request that completes when a deadline passes

use super::{Request, Scheduler, TimerHandle};
use crate::error::Result;
use tokio::time::Instant;

/// Private state of a wakeup request
#[derive(Debug, Default)]
pub struct WakeupState {
    timer: Option<TimerHandle>,
}

/// Create a request that becomes `Done` at `deadline`
pub fn wakeup_send(sched: &Scheduler, deadline: Instant) -> Result<Request<WakeupState>> {
    let req = Request::new(sched, WakeupState::default());
    let weak = req.downgrade();
    let timer = sched.add_timer(deadline, move || {
        if let Some(req) = weak.upgrade() {
            let fired = req.data_mut().timer.take();
            drop(fired);
            req.done();
        }
    })?;
    req.data_mut().timer = Some(timer);
    Ok(req)
}

pub fn wakeup_recv(req: &Request<WakeupState>) -> Result<()> {
    req.status()
}
