use core::fmt;
use std::collections::BTreeMap;
use std::mem;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No timer could be armed; later delayed calls would never fire.
    #[error("cannot arm timer for {deadline}: {reason}")]
    Rearm {
        deadline: DateTime<Utc>,
        reason: String,
    },
}

/// When a delayed call should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireTime {
    /// As soon as possible
    Now,
    Utc(DateTime<Utc>),
    /// Timestamps without a zone are taken as UTC
    Naive(NaiveDateTime),
    Fixed(DateTime<FixedOffset>),
}

impl FireTime {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            FireTime::Now => now,
            FireTime::Utc(when) => when,
            FireTime::Naive(when) => when.and_utc(),
            FireTime::Fixed(when) => when.with_timezone(&Utc),
        }
    }
}

impl From<DateTime<Utc>> for FireTime {
    fn from(when: DateTime<Utc>) -> Self {
        FireTime::Utc(when)
    }
}

impl From<NaiveDateTime> for FireTime {
    fn from(when: NaiveDateTime) -> Self {
        FireTime::Naive(when)
    }
}

impl From<DateTime<FixedOffset>> for FireTime {
    fn from(when: DateTime<FixedOffset>) -> Self {
        FireTime::Fixed(when)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelayedCall<C> {
    pub when: FireTime,
    pub context: C,
}

impl<C> DelayedCall<C> {
    pub fn at(when: impl Into<FireTime>, context: C) -> Self {
        Self {
            when: when.into(),
            context,
        }
    }

    pub fn now(context: C) -> Self {
        Self {
            when: FireTime::Now,
            context,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_fired: u64,
    /// Dropped by `replace` or `clear` before firing
    pub total_superseded: u64,
    pub total_rearms: u64,
}

/// Handle on one armed timer.
pub trait TimerHandle: Send {
    fn cancel(self: Box<Self>);
}

/// Source of wake-ups. `generation` must be handed back with the wake-up so
/// that a stale one can be recognised.
pub trait Timer: Send {
    fn arm(
        &mut self,
        deadline: DateTime<Utc>,
        generation: u64,
    ) -> Result<Box<dyn TimerHandle>, SchedulerError>;
}

pub enum TimerState {
    Idle,
    Armed {
        handle: Box<dyn TimerHandle>,
        deadline: DateTime<Utc>,
        generation: u64,
    },
}

impl fmt::Debug for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::Idle => write!(f, "Idle"),
            TimerState::Armed {
                deadline,
                generation,
                ..
            } => f
                .debug_struct("Armed")
                .field("deadline", deadline)
                .field("generation", generation)
                .finish(),
        }
    }
}

/// Time-ordered queue of delayed calls driving a single timer.
///
/// Entries are keyed by `(fire time, insertion sequence)`, so equal fire times
/// keep their scheduling order. The timer is only ever touched through
/// [`Scheduler::rearm`], which cancels the armed handle before arming the next
/// one: at most one timer is outstanding at any time.
pub struct Scheduler<C> {
    queue: BTreeMap<(DateTime<Utc>, u64), C>,
    next_sequence: u64,
    timer: Box<dyn Timer>,
    state: TimerState,
    generation: u64,
    stats: SchedulerStats,
}

impl<C: fmt::Debug> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<C> Scheduler<C> {
    pub fn new(timer: Box<dyn Timer>) -> Self {
        Self {
            queue: BTreeMap::new(),
            next_sequence: 0,
            timer,
            state: TimerState::Idle,
            generation: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn insert(&mut self, call: DelayedCall<C>, now: DateTime<Utc>) -> DateTime<Utc> {
        let fire_at = call.when.resolve(now);
        let key = (fire_at, self.next_sequence);
        self.next_sequence += 1;
        self.queue.insert(key, call.context);
        self.stats.total_scheduled += 1;
        fire_at
    }

    /// Queue a call, re-arming when it became the earliest entry.
    pub fn schedule(&mut self, call: DelayedCall<C>, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let fire_at = self.insert(call, now);
        match self.next_deadline() {
            Some(earliest) if earliest == fire_at && self.armed_deadline() != Some(fire_at) => {
                self.rearm()
            }
            _ if matches!(self.state, TimerState::Idle) => self.rearm(),
            _ => Ok(()),
        }
    }

    /// Supersede the whole plan with `calls`.
    pub fn replace(
        &mut self,
        calls: impl IntoIterator<Item = DelayedCall<C>>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.stats.total_superseded += self.queue.len() as u64;
        self.queue.clear();
        for call in calls {
            self.insert(call, now);
        }
        self.rearm()
    }

    /// Drop every pending call and disarm.
    pub fn clear(&mut self) {
        self.stats.total_superseded += self.queue.len() as u64;
        self.queue.clear();
        self.disarm();
    }

    /// Pop every call due at `now` in fire order, then re-arm for what is
    /// left. The popped calls are returned even when re-arming fails.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> (Vec<C>, Result<(), SchedulerError>) {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        self.stats.total_fired += due.len() as u64;
        (due, self.rearm())
    }

    /// Handle a wake-up from the timer armed under `generation`. Wake-ups of
    /// cancelled timers are ignored.
    pub fn on_timer_fire(
        &mut self,
        generation: u64,
        now: DateTime<Utc>,
    ) -> (Vec<C>, Result<(), SchedulerError>) {
        match self.state {
            TimerState::Armed {
                generation: armed, ..
            } if armed == generation => self.take_due(now),
            _ => {
                debug!(generation, current = self.generation, "ignoring stale timer wake-up");
                (Vec::new(), Ok(()))
            }
        }
    }

    fn disarm(&mut self) {
        if let TimerState::Armed { handle, .. } = mem::replace(&mut self.state, TimerState::Idle) {
            handle.cancel();
        }
    }

    /// The only timer transition: cancel whatever is armed, then arm for the
    /// earliest entry if there is one.
    pub fn rearm(&mut self) -> Result<(), SchedulerError> {
        self.disarm();
        let Some(deadline) = self.next_deadline() else {
            return Ok(());
        };

        self.generation += 1;
        let handle = self.timer.arm(deadline, self.generation)?;
        self.stats.total_rearms += 1;
        self.state = TimerState::Armed {
            handle,
            deadline,
            generation: self.generation,
        };
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(fire_at, _)| *fire_at)
    }

    pub fn armed_deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TimerState::Idle => None,
            TimerState::Armed { deadline, .. } => Some(deadline),
        }
    }

    pub fn timer_state(&self) -> &TimerState {
        &self.state
    }

    /// Pending calls in fire order.
    pub fn pending(&self) -> impl Iterator<Item = (DateTime<Utc>, &C)> {
        self.queue.iter().map(|((fire_at, _), call)| (*fire_at, call))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

impl<C> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Wake-up delivered by [`TokioTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub address: u8,
    pub generation: u64,
}

/// Timer backed by a sleeping tokio task that reports back on a channel.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    address: u8,
    wakeups: mpsc::UnboundedSender<TimerFired>,
}

impl TokioTimer {
    pub fn new(address: u8, wakeups: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self { address, wakeups }
    }
}

struct TokioTimerHandle(JoinHandle<()>);

impl TimerHandle for TokioTimerHandle {
    fn cancel(self: Box<Self>) {
        self.0.abort();
    }
}

impl Timer for TokioTimer {
    fn arm(
        &mut self,
        deadline: DateTime<Utc>,
        generation: u64,
    ) -> Result<Box<dyn TimerHandle>, SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| SchedulerError::Rearm {
            deadline,
            reason: e.to_string(),
        })?;
        if self.wakeups.is_closed() {
            return Err(SchedulerError::Rearm {
                deadline,
                reason: "wake-up channel closed".to_string(),
            });
        }

        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let wakeups = self.wakeups.clone();
        let address = self.address;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wakeups.send(TimerFired {
                address,
                generation,
            });
        });
        Ok(Box::new(TokioTimerHandle(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::{Arc, Mutex};

    /// Records armed timers; an entry is live until cancelled.
    #[derive(Default, Clone)]
    struct ManualTimer {
        live: Arc<Mutex<Vec<(u64, DateTime<Utc>)>>>,
        fail: Arc<Mutex<bool>>,
    }

    struct ManualHandle {
        generation: u64,
        live: Arc<Mutex<Vec<(u64, DateTime<Utc>)>>>,
    }

    impl TimerHandle for ManualHandle {
        fn cancel(self: Box<Self>) {
            self.live.lock().unwrap().retain(|(g, _)| *g != self.generation);
        }
    }

    impl Timer for ManualTimer {
        fn arm(
            &mut self,
            deadline: DateTime<Utc>,
            generation: u64,
        ) -> Result<Box<dyn TimerHandle>, SchedulerError> {
            if *self.fail.lock().unwrap() {
                return Err(SchedulerError::Rearm {
                    deadline,
                    reason: "no loop".into(),
                });
            }
            self.live.lock().unwrap().push((generation, deadline));
            Ok(Box::new(ManualHandle {
                generation,
                live: Arc::clone(&self.live),
            }))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    #[test]
    fn test_fires_due_calls_in_order_and_leaves_one_timer() {
        let timer = ManualTimer::default();
        let mut scheduler = Scheduler::new(Box::new(timer.clone()));
        let now = t0();

        scheduler.schedule(DelayedCall::at(now + secs(60), "t3"), now - secs(20)).unwrap();
        scheduler.schedule(DelayedCall::at(now - secs(5), "t2"), now - secs(20)).unwrap();
        scheduler.schedule(DelayedCall::at(now - secs(10), "t1"), now - secs(20)).unwrap();
        assert_eq!(timer.live.lock().unwrap().len(), 1);

        let (fired, rearm) = scheduler.take_due(now);
        rearm.unwrap();
        assert_eq!(fired, ["t1", "t2"]);

        let live = timer.live.lock().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1, now + secs(60));
        assert_eq!(scheduler.armed_deadline(), Some(now + secs(60)));
    }

    #[test]
    fn test_equal_times_keep_insertion_order() {
        let mut scheduler = Scheduler::new(Box::new(ManualTimer::default()));
        let now = t0();
        for name in ["a", "b", "c"] {
            scheduler.schedule(DelayedCall::at(now, name), now).unwrap();
        }
        assert_eq!(scheduler.take_due(now).0, ["a", "b", "c"]);
        assert!(matches!(scheduler.timer_state(), TimerState::Idle));
    }

    #[test]
    fn test_never_fires_early() {
        let mut scheduler = Scheduler::new(Box::new(ManualTimer::default()));
        let now = t0();
        scheduler.schedule(DelayedCall::at(now + secs(1), 1), now).unwrap();
        assert!(scheduler.take_due(now).0.is_empty());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.take_due(now + secs(1)).0, [1]);
    }

    #[test]
    fn test_replace_supersedes_plan() {
        let timer = ManualTimer::default();
        let mut scheduler = Scheduler::new(Box::new(timer.clone()));
        let now = t0();
        scheduler.schedule(DelayedCall::at(now, "old-1"), now).unwrap();
        scheduler.schedule(DelayedCall::at(now + secs(5), "old-2"), now).unwrap();

        scheduler
            .replace(
                [
                    DelayedCall::at(now + secs(2), "new-2"),
                    DelayedCall::at(now + secs(1), "new-1"),
                ],
                now,
            )
            .unwrap();

        assert_eq!(timer.live.lock().unwrap().len(), 1);
        assert_eq!(scheduler.take_due(now + secs(10)).0, ["new-1", "new-2"]);
        assert_eq!(scheduler.stats().total_superseded, 2);
        assert_eq!(scheduler.stats().total_fired, 2);
    }

    #[test]
    fn test_naive_time_is_utc() {
        let now = t0();
        let naive = (now + secs(30)).naive_utc();
        let offset = FixedOffset::east_opt(3600).unwrap();

        let mut scheduler = Scheduler::new(Box::new(ManualTimer::default()));
        scheduler.schedule(DelayedCall::at(naive, "naive"), now).unwrap();
        scheduler.schedule(DelayedCall::at(now + secs(30), "utc"), now).unwrap();
        scheduler
            .schedule(DelayedCall::at((now + secs(30)).with_timezone(&offset), "fixed"), now)
            .unwrap();

        let times: Vec<_> = scheduler.pending().map(|(when, _)| when).collect();
        assert_eq!(times, [now + secs(30); 3]);
        assert!(scheduler.take_due(now + secs(29)).0.is_empty());
        assert_eq!(scheduler.take_due(now + secs(30)).0, ["naive", "utc", "fixed"]);
    }

    #[test]
    fn test_now_fires_immediately() {
        let mut scheduler = Scheduler::new(Box::new(ManualTimer::default()));
        let now = t0();
        scheduler.schedule(DelayedCall::now("asap"), now).unwrap();
        assert_eq!(scheduler.armed_deadline(), Some(now));
        assert_eq!(scheduler.take_due(now).0, ["asap"]);
    }

    #[test]
    fn test_stale_wakeup_ignored() {
        let mut scheduler = Scheduler::new(Box::new(ManualTimer::default()));
        let now = t0();
        scheduler.schedule(DelayedCall::at(now + secs(5), "late"), now).unwrap();
        scheduler.schedule(DelayedCall::at(now + secs(1), "early"), now).unwrap();

        // First timer was replaced by the second arm
        let (fired, _) = scheduler.on_timer_fire(1, now + secs(10));
        assert!(fired.is_empty());
        let (fired, _) = scheduler.on_timer_fire(2, now + secs(1));
        assert_eq!(fired, ["early"]);
    }

    #[test]
    fn test_rearm_failure_reported_and_idle() {
        let timer = ManualTimer::default();
        let mut scheduler = Scheduler::new(Box::new(timer.clone()));
        let now = t0();
        *timer.fail.lock().unwrap() = true;

        let err = scheduler.schedule(DelayedCall::at(now, ()), now).unwrap_err();
        assert!(matches!(err, SchedulerError::Rearm { deadline, .. } if deadline == now));
        assert!(matches!(scheduler.timer_state(), TimerState::Idle));
    }

    #[test]
    fn test_clear_and_drop_cancel_timer() {
        let timer = ManualTimer::default();
        let mut scheduler = Scheduler::new(Box::new(timer.clone()));
        let now = t0();
        scheduler.schedule(DelayedCall::at(now, 1), now).unwrap();
        scheduler.clear();
        assert!(timer.live.lock().unwrap().is_empty());
        assert!(scheduler.is_empty());

        scheduler.schedule(DelayedCall::at(now, 2), now).unwrap();
        drop(scheduler);
        assert!(timer.live.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tokio_timer_delivers_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = TokioTimer::new(0x21, tx);
        let _handle = timer.arm(Utc::now(), 7).unwrap();
        let fired = rx.recv().await.unwrap();
        assert_eq!(
            fired,
            TimerFired {
                address: 0x21,
                generation: 7
            }
        );
    }

    #[test]
    fn test_tokio_timer_needs_runtime() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = TokioTimer::new(0x21, tx);
        assert!(matches!(timer.arm(Utc::now(), 1), Err(SchedulerError::Rearm { .. })));
    }
}
