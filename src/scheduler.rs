/*!
Discrete-event scheduling of simulation actions

A [`Scheduler`] owns the simulated clock. Actions are enqueued with an
absolute fire time and dispatched one at a time, in order of fire time, to a
[`Handler`]. Actions with equal fire times are dispatched in the order they
were enqueued.

# Example
```
use pow_network_sim::scheduler::{Event, Scheduler, SimTime};

#[derive(Debug)]
struct Ping(u32);

impl Event for Ping {
    type Kind = u32;

    fn kind(&self) -> u32 {
        self.0
    }
}

let mut scheduler = Scheduler::new();
scheduler.enqueue(Ping(2), SimTime::from_millis(5.0));
scheduler.enqueue(Ping(1), SimTime::from_millis(1.0));

let mut seen = vec![];
scheduler.run_until_empty(&mut |ping: Ping, _: &mut Scheduler<Ping>| {
    seen.push(ping.0)
});

assert_eq!(seen, vec![1, 2]);
assert_eq!(scheduler.now(), SimTime::from_millis(5.0));
```
*/

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt::{self, Debug, Display},
    ops::Add,
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
};

use log::{debug, trace};
use ordered_float::OrderedFloat;

/// A point in simulated time, in milliseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(OrderedFloat<f64>);

impl SimTime {
    pub const ZERO: SimTime = SimTime(OrderedFloat(0.0));

    pub fn from_millis(millis: f64) -> Self {
        Self(OrderedFloat(millis))
    }

    pub fn as_millis(&self) -> f64 {
        self.0.into_inner()
    }
}

impl Add<f64> for SimTime {
    type Output = SimTime;

    fn add(self, millis: f64) -> SimTime {
        SimTime::from_millis(self.as_millis() + millis)
    }
}

impl Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis())
    }
}

/// An action which can be dispatched by a [`Scheduler`].
pub trait Event {
    /// Lightweight description of an event, handed to [`Observer`]s after the
    /// event itself has been consumed by its [`Handler`].
    type Kind: Copy + Debug;

    fn kind(&self) -> Self::Kind;
}

/// Consumes dispatched actions. Handlers may enqueue further actions, which
/// are visible to the same [`Scheduler::run`] call.
pub trait Handler<A> {
    fn handle(&mut self, action: A, scheduler: &mut Scheduler<A>);
}

impl<A, F> Handler<A> for F
where
    F: FnMut(A, &mut Scheduler<A>),
{
    fn handle(&mut self, action: A, scheduler: &mut Scheduler<A>) {
        self(action, scheduler)
    }
}

/// Notified after every dispatched action. The only way to end a run early
/// is through the given [`StopFlag`].
pub trait Observer<K> {
    fn observe(&mut self, now: SimTime, kind: K, stop: &StopFlag);
}

impl<K, F> Observer<K> for F
where
    F: FnMut(SimTime, K, &StopFlag),
{
    fn observe(&mut self, now: SimTime, kind: K, stop: &StopFlag) {
        self(now, kind, stop)
    }
}

/// Externally raised request to stop a [`Scheduler`] run. Checked once per
/// dispatch loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn raise(&self) {
        self.0.store(true, atomic::Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(atomic::Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Scheduled<A> {
    fire_at: SimTime,
    seq: u64,
    action: A,
}

// Ordered by fire time, then by insertion order. The action never takes part.
impl<A> PartialEq for Scheduled<A> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl<A> Eq for Scheduled<A> {}

impl<A> PartialOrd for Scheduled<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Scheduled<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Priority queue of timestamped actions together with the simulated clock.
#[derive(Debug)]
pub struct Scheduler<A> {
    now: SimTime,
    next_seq: u64,
    dispatched: u64,
    queue: BinaryHeap<Reverse<Scheduled<A>>>,
    stop: StopFlag,
}

impl<A> Default for Scheduler<A> {
    fn default() -> Self {
        Self {
            now: SimTime::ZERO,
            next_seq: 0,
            dispatched: 0,
            queue: BinaryHeap::new(),
            stop: StopFlag::default(),
        }
    }
}

impl<A> Scheduler<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time: the fire time of the last dispatched action.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of actions dispatched so far.
    #[inline]
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns a handle which can be used to stop [`Scheduler::run`].
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Enqueues `action` to fire at `fire_at`. Fire times in the past are
    /// clamped to [`Scheduler::now`].
    pub fn enqueue(&mut self, action: A, fire_at: SimTime) {
        let fire_at = fire_at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;

        trace!("scheduled #{} at {}", seq, fire_at);
        self.queue.push(Reverse(Scheduled { fire_at, seq, action }));
    }

    /// Enqueues `action` to fire `delay` milliseconds from now.
    pub fn enqueue_after(&mut self, action: A, delay: f64) {
        self.enqueue(action, self.now + delay);
    }

    /// Removes the earliest pending action and advances the clock to its fire
    /// time.
    pub fn pop(&mut self) -> Option<(SimTime, A)> {
        let Reverse(Scheduled { fire_at, action, .. }) = self.queue.pop()?;
        self.now = fire_at;

        Some((fire_at, action))
    }
}

impl<A: Event> Scheduler<A> {
    /// Dispatches actions until the queue is empty or the stop flag is
    /// raised. `observer` is notified after each dispatched action.
    pub fn run<H, O>(&mut self, handler: &mut H, observer: &mut O)
    where
        H: Handler<A>,
        O: Observer<A::Kind>,
    {
        while !self.stop.is_raised() {
            let Some((now, action)) = self.pop() else {
                break;
            };

            let kind = action.kind();
            debug!("dispatching {:?} at {}", kind, now);

            handler.handle(action, self);
            self.dispatched += 1;

            observer.observe(now, kind, &self.stop);
        }
    }

    /// [`Scheduler::run`] without an observer.
    pub fn run_until_empty<H: Handler<A>>(&mut self, handler: &mut H) {
        self.run(handler, &mut |_: SimTime, _: A::Kind, _: &StopFlag| {});
    }
}
