// ! Timer plumbing for the connection core
// !
// ! Two timer pools feed the core's mailbox. The FSM-scoped pool holds at
// ! most one armed timer (the current connection deadline: handshake, sweep
// ! tick, backoff expiry, or closing grace); arming a new one replaces the
// ! old. Per-request timers are armed in any number and matched by id
// ! against the request table when they fire. Cancellation is best-effort
// ! task abort; a fire that races a cancel is discarded by the receiver.

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Duration;

use crate::client::connection::Event;

/// The kinds of deadline the single FSM-scoped timer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FsmTimerKind {
    InitDeadline,
    TombstoneSweep,
    BackoffExpire,
    CloseGrace,
}

/// Timer events delivered to the core mailbox
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerFire {
    /// The FSM-scoped timer fired. Stale epochs are discarded.
    Fsm { epoch: u64, kind: FsmTimerKind },
    /// A request's timeout budget ran out
    RequestTimeout { id: i64 },
    /// A pending retry is due for another send attempt
    Retry { id: i64 },
}

/// The single FSM-scoped timer slot.
///
/// Each arm bumps the epoch, so a fire from a replaced timer that already
/// made it into the mailbox no longer matches.
pub(crate) struct FsmTimer {
    epoch: u64,
    handle: Option<AbortHandle>,
}

impl FsmTimer {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            handle: None,
        }
    }

    /// Arm the timer, replacing whatever was armed before
    pub fn arm(&mut self, events: &mpsc::Sender<Event>, kind: FsmTimerKind, delay: Duration) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.epoch += 1;
        let epoch = self.epoch;
        let events = events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(Event::Timer(TimerFire::Fsm { epoch, kind }))
                .await;
        })
        .abort_handle();
        self.handle = Some(handle);
    }

    /// Whether a delivered fire belongs to the currently armed timer
    pub fn accepts(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }
}

/// Arm a per-request timer delivering `fire` after `delay`
pub(crate) fn arm_request_timer(
    events: &mpsc::Sender<Event>,
    fire: TimerFire,
    delay: Duration,
) -> AbortHandle {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(Event::Timer(fire)).await;
    })
    .abort_handle()
}

/// A delay of `base_ms` multiplied by a uniform factor in `1 ± jitter`
pub(crate) fn jittered(base_ms: u64, jitter: f64) -> Duration {
    Duration::from_millis(jittered_ms(base_ms, jitter))
}

/// Jittered milliseconds, for schedules that stay in integer math
pub(crate) fn jittered_ms(base_ms: u64, jitter: f64) -> u64 {
    let factor = 1.0 + (fastrand::f64() * 2.0 - 1.0) * jitter;
    ((base_ms as f64) * factor).max(0.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..1000 {
            let ms = jittered_ms(10, 0.5);
            assert!((5..=15).contains(&ms), "jittered delay {ms} out of range");
        }
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        assert_eq!(jittered_ms(1000, 0.0), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fsm_timer_fires_with_current_epoch() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timer = FsmTimer::new();

        timer.arm(&tx, FsmTimerKind::TombstoneSweep, Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(60)).await;

        match rx.recv().await.unwrap() {
            Event::Timer(TimerFire::Fsm { epoch, kind }) => {
                assert_eq!(kind, FsmTimerKind::TombstoneSweep);
                assert!(timer.accepts(epoch));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_invalidates_previous_epoch() {
        let (tx, _rx) = mpsc::channel(8);
        let mut timer = FsmTimer::new();

        timer.arm(&tx, FsmTimerKind::InitDeadline, Duration::from_secs(10));
        let first_epoch = 1;
        assert!(timer.accepts(first_epoch));

        timer.arm(&tx, FsmTimerKind::BackoffExpire, Duration::from_secs(1));
        assert!(!timer.accepts(first_epoch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timer_delivers_fire() {
        let (tx, mut rx) = mpsc::channel(8);
        arm_request_timer(
            &tx,
            TimerFire::RequestTimeout { id: 4 },
            Duration::from_millis(20),
        );
        tokio::time::advance(Duration::from_millis(25)).await;

        match rx.recv().await.unwrap() {
            Event::Timer(fire) => assert_eq!(fire, TimerFire::RequestTimeout { id: 4 }),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_request_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = arm_request_timer(
            &tx,
            TimerFire::Retry { id: 2 },
            Duration::from_millis(20),
        );
        handle.abort();
        drop(tx);

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(rx.recv().await.is_none());
    }
}
