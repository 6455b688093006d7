use super::*;
use std::cell::Cell;

fn counter() -> Rc<Cell<u32>> {
    Rc::new(Cell::new(0))
}

fn count_into<S: 'static>(hits: &Rc<Cell<u32>>) -> impl FnOnce(&Request<S>) + 'static {
    let hits = Rc::clone(hits);
    move |_req| hits.set(hits.get() + 1)
}

fn sleep(sched: &Scheduler, ms: u64) {
    sched.block_on(async { tokio::time::sleep(Duration::from_millis(ms)).await });
}

#[test]
fn test_new_request_is_in_progress() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, 7u32);
    assert!(req.is_in_progress());
    assert_eq!(req.state(), ReqState::InProgress);
    assert!(req.peek_error().is_none());
    assert_eq!(*req.data(), 7);
    assert!(matches!(req.status(), Err(Error::InvalidState(_))));
}

#[test]
fn test_finish_is_idempotent() {
    let sched = Scheduler::new().unwrap();
    let hits = counter();
    let req = Request::new(&sched, ());
    req.set_continuation(count_into(&hits));

    req.done();
    assert_eq!(req.state(), ReqState::Done);
    assert_eq!(hits.get(), 1);

    req.done();
    req.fail(NtStatus::AccessDenied);
    req.forward(&Error::Timeout);
    assert!(req.fail_if_none(None::<u8>).is_none());

    assert_eq!(req.state(), ReqState::Done);
    assert_eq!(hits.get(), 1);
    assert!(req.status().is_ok());
}

#[test]
fn test_fail_with_success_is_a_no_op() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());
    assert!(!req.fail(NtStatus::Success));
    assert!(req.is_in_progress());
}

#[test]
fn test_fail_with_status_is_user_error() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());
    assert!(req.fail(NtStatus::ConnectionRefused));
    assert_eq!(
        req.peek_error(),
        Some(ReqState::UserError(NtStatus::ConnectionRefused))
    );
    match req.status() {
        Err(Error::Status(status)) => assert_eq!(status, NtStatus::ConnectionRefused),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_fail_if_none() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());

    assert_eq!(req.fail_if_none(Some(5)), Some(5));
    assert!(req.is_in_progress());

    assert_eq!(req.fail_if_none(None::<i32>), None);
    assert_eq!(req.state(), ReqState::NoMemory);
    assert!(matches!(req.status(), Err(Error::NoMemory)));
}

#[test]
fn test_forward_keeps_timeout_and_eof_distinct() {
    let sched = Scheduler::new().unwrap();

    let timed_out = Request::new(&sched, ());
    timed_out.forward(&Error::Timeout);
    assert_eq!(timed_out.state(), ReqState::TimedOut);

    let eof = Request::new(&sched, ());
    eof.forward(&Error::EndOfFile);
    assert_eq!(eof.state(), ReqState::UserError(NtStatus::EndOfFile));
    assert!(eof.status().unwrap_err().is_end_of_file());

    let io = Request::new(&sched, ());
    io.forward(&Error::Io(io::Error::from_raw_os_error(
        nix::errno::Errno::ECONNRESET as i32,
    )));
    assert_eq!(io.state(), ReqState::UserError(NtStatus::ConnectionReset));
}

#[test]
fn test_posted_continuation_fires_on_later_turn() {
    let sched = Scheduler::new().unwrap();
    let hits = counter();

    let req = Request::new(&sched, ());
    req.done();
    let req = req.post().unwrap();

    req.set_continuation(count_into(&hits));
    assert_eq!(hits.get(), 0, "continuation ran inside set_continuation");

    sched.turn();
    assert_eq!(hits.get(), 1);

    sched.turn();
    sched.turn();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_late_continuation_on_terminal_request_is_deferred() {
    let sched = Scheduler::new().unwrap();
    let hits = counter();

    let req = Request::new(&sched, ());
    assert!(req.fail(NtStatus::PipeBroken));

    req.set_continuation(count_into(&hits));
    assert_eq!(hits.get(), 0);

    sched.turn();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_continuation_registered_once() {
    let sched = Scheduler::new().unwrap();
    let first = counter();
    let second = counter();

    let req = Request::new(&sched, ());
    assert!(req.set_continuation(count_into(&first)));
    req.done();
    assert!(!req.set_continuation(count_into(&second)));
    sched.turn();

    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 0);
}

#[test]
fn test_continuation_sees_private_state() {
    let sched = Scheduler::new().unwrap();
    let seen = Rc::new(Cell::new(0u32));

    let req = Request::new(&sched, 41u32);
    let sink = Rc::clone(&seen);
    req.set_continuation(move |req| sink.set(*req.data() + 1));
    req.done();

    assert_eq!(seen.get(), 42);
}

#[test]
fn test_timeout_fires() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let hits = counter();

    let req = Request::new(&sched, ());
    assert!(req.set_timeout_after(Duration::from_millis(50)));
    req.set_continuation(count_into(&hits));

    let start = sched.now();
    sched.wait(&req);

    assert_eq!(req.state(), ReqState::TimedOut);
    assert!(req.status().unwrap_err().is_timeout());
    assert!(sched.now() - start >= Duration::from_millis(50));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_completion_cancels_timeout() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let hits = counter();

    let req = wakeup_send(&sched, sched.now() + Duration::from_millis(10)).unwrap();
    assert!(req.set_timeout_after(Duration::from_millis(20)));
    req.set_continuation(count_into(&hits));

    sched.wait(&req);
    assert!(wakeup_recv(&req).is_ok());
    assert!(!req.describe().contains("timeout[armed]"));

    sleep(&sched, 100);
    assert_eq!(req.state(), ReqState::Done);
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_timeout_wins_race() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let hits = counter();

    let req = wakeup_send(&sched, sched.now() + Duration::from_millis(30)).unwrap();
    assert!(req.set_timeout_after(Duration::from_millis(5)));
    req.set_continuation(count_into(&hits));

    sleep(&sched, 100);
    assert_eq!(req.state(), ReqState::TimedOut);
    assert!(wakeup_recv(&req).unwrap_err().is_timeout());
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_set_timeout_replaces_previous() {
    let sched = Scheduler::with_paused_clock().unwrap();

    let req = Request::new(&sched, ());
    assert!(req.set_timeout_after(Duration::from_millis(5)));
    assert!(req.set_timeout_after(Duration::from_millis(500)));

    sleep(&sched, 50);
    assert!(req.is_in_progress());

    sched.wait(&req);
    assert_eq!(req.state(), ReqState::TimedOut);
}

#[test]
fn test_dropping_request_cancels_timers() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let hits = counter();

    let req = wakeup_send(&sched, sched.now() + Duration::from_millis(10)).unwrap();
    assert!(req.set_timeout_after(Duration::from_millis(5)));
    req.set_continuation(count_into(&hits));
    drop(req);

    sleep(&sched, 50);
    assert_eq!(hits.get(), 0);
}

#[test]
fn test_dropped_timer_handle_never_fires() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let hits = counter();

    let sink = Rc::clone(&hits);
    let timer = sched
        .add_timer(sched.now() + Duration::from_millis(5), move || {
            sink.set(sink.get() + 1)
        })
        .unwrap();
    drop(timer);

    sleep(&sched, 20);
    assert_eq!(hits.get(), 0);
}

#[test]
fn test_post_fails_after_shutdown() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());
    req.done();
    sched.shutdown();

    assert!(sched.is_shut_down());
    assert!(matches!(req.post(), Err(Error::InvalidState(_))));
}

#[test]
fn test_set_timeout_failure_leaves_request_untouched() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());
    sched.shutdown();

    assert!(!req.set_timeout_after(Duration::from_millis(5)));
    assert!(req.is_in_progress());
}

#[test]
fn test_describe() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, 0u16);
    assert!(req.set_timeout_after(Duration::from_secs(5)));

    let text = req.describe();
    assert!(text.contains(&format!("#{}", req.id())));
    assert!(text.contains("u16"));
    assert!(text.contains("tests.rs"));
    assert!(text.contains("state[in progress]"));
    assert!(text.contains("timeout[armed]"));

    req.fail(NtStatus::AccessDenied);
    let text = format!("{:?}", req);
    assert!(text.contains("user error"));
    assert!(text.contains("0xC0000022"));
    assert!(text.contains("timeout[none]"));
}

#[test]
fn test_weak_request_does_not_keep_request_alive() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());
    let weak = req.downgrade();
    assert!(weak.upgrade().is_some());
    drop(req);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_continuation_on_terminal_request_after_shutdown_is_refused() {
    let sched = Scheduler::new().unwrap();
    let hits = counter();

    let req = Request::new(&sched, ());
    req.done();
    sched.shutdown();

    assert!(!req.set_continuation(count_into(&hits)));
    sched.turn();
    assert_eq!(hits.get(), 0);
}

#[test]
fn test_continuation_on_pending_request_after_shutdown_still_fires() {
    let sched = Scheduler::new().unwrap();
    let hits = counter();

    let req = Request::new(&sched, ());
    sched.shutdown();

    assert!(req.set_continuation(count_into(&hits)));
    req.done();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_every_waiter_is_woken() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let req = wakeup_send(&sched, sched.now() + Duration::from_millis(10)).unwrap();

    let finished = sched.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(req.wait(), req.wait(), req.wait());
        })
        .await
        .is_ok()
    });

    assert!(finished);
    assert!(wakeup_recv(&req).is_ok());
}

#[test]
fn test_wait_returns_when_nothing_can_finish_the_request() {
    let sched = Scheduler::new().unwrap();
    let req = Request::new(&sched, ());

    assert!(!sched.wait(&req));
    assert!(req.is_in_progress());
}

#[test]
fn test_wait_gives_up_once_the_last_timer_is_cancelled() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let req = Request::new(&sched, ());
    assert!(req.set_timeout_after(Duration::from_millis(50)));
    let cancel = req.downgrade();
    let _cancel = sched
        .add_timer(sched.now() + Duration::from_millis(10), move || {
            if let Some(req) = cancel.upgrade() {
                let armed = req.inner.core.borrow_mut().timeout.take();
                drop(armed);
            }
        })
        .unwrap();

    assert!(!sched.wait(&req));
    assert!(req.is_in_progress());
}

#[test]
fn test_wait_reports_completion() {
    let sched = Scheduler::with_paused_clock().unwrap();
    let req = wakeup_send(&sched, sched.now() + Duration::from_millis(5)).unwrap();
    assert!(sched.wait(&req));
    assert!(sched.wait(&req));
}
