//! Deadline scheduler for stream signals.
//!
//! State machines never sleep. They schedule a signal for a stream and the
//! owner of the event loop polls due signals, feeding each back to the
//! stream as a `Signal` frame.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tracing::trace;
use triomphe::Arc;

/// Handle of a scheduled signal, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredSignal {
    pub id: SignalId,
    pub stream_id: u64,
    pub signal: u32,
}

enum Clock {
    System(Instant),
    Manual(u64),
}

struct Scheduled {
    next_id: u64,
    clock: Clock,
    timers: BTreeMap<(u64, SignalId), FiredSignal>,
    deadlines: HashMap<SignalId, u64>,
}

/// Shared signal scheduler, clones share the same timers.
#[derive(Clone)]
pub struct Signals {
    inner: Arc<Mutex<Scheduled>>,
}

impl Default for Signals {
    fn default() -> Self {
        Self::system()
    }
}

impl Signals {
    /// Scheduler driven by the monotonic system clock.
    pub fn system() -> Self {
        Self::with_clock(Clock::System(Instant::now()))
    }

    /// Scheduler whose clock only moves through [`Signals::advance_to`].
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(0))
    }

    fn with_clock(clock: Clock) -> Self {
        let scheduled = Scheduled { next_id: 0, clock, timers: BTreeMap::new(), deadlines: HashMap::new() };
        Self { inner: Arc::new(Mutex::new(scheduled)) }
    }

    /// Milliseconds since the scheduler was created.
    pub fn now(&self) -> u64 {
        let scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match scheduled.clock {
            Clock::System(start) => u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            Clock::Manual(now) => now,
        }
    }

    pub fn signal_at(&self, deadline: u64, stream_id: u64, signal: u32) -> SignalId {
        let mut scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        scheduled.next_id += 1;
        let id = SignalId(scheduled.next_id);

        scheduled.timers.insert((deadline, id), FiredSignal { id, stream_id, signal });
        scheduled.deadlines.insert(id, deadline);

        trace!(stream_id, signal, deadline, "signal scheduled");
        id
    }

    pub fn signal_now(&self, stream_id: u64, signal: u32) -> SignalId {
        let now = self.now();
        self.signal_at(now, stream_id, signal)
    }

    /// Cancels a pending signal, returns `false` when it already fired.
    pub fn cancel(&self, id: SignalId) -> bool {
        let mut scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match scheduled.deadlines.remove(&id) {
            Some(deadline) => scheduled.timers.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Removes and returns every signal due at `now`, earliest first.
    pub fn poll_due(&self, now: u64) -> Vec<FiredSignal> {
        let mut scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let mut fired = Vec::new();
        while let Some(entry) = scheduled.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }

            let signal = entry.remove();
            scheduled.deadlines.remove(&signal.id);
            fired.push(signal);
        }

        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        let scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        scheduled.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn pending(&self) -> usize {
        let scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        scheduled.timers.len()
    }

    /// Moves a manual clock forward, no-op for the system clock.
    pub fn advance_to(&self, now: u64) {
        let mut scheduled = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Clock::Manual(current) = &mut scheduled.clock {
            *current = now.max(*current);
        }
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals").field("pending", &self.pending()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_in_deadline_order() {
        let signals = Signals::manual();
        signals.signal_at(30, 1, 0);
        signals.signal_at(10, 3, 1);
        signals.signal_at(20, 5, 2);

        assert_eq!(signals.next_deadline(), Some(10));

        let fired: Vec<_> = signals.poll_due(20).into_iter().map(|s| s.stream_id).collect();
        assert_eq!(fired, [3, 5]);
        assert_eq!(signals.pending(), 1);
    }

    #[test]
    fn test_cancel() {
        let signals = Signals::manual();
        let id = signals.signal_at(5, 1, 0);

        assert!(signals.cancel(id));
        assert!(!signals.cancel(id));
        assert!(signals.poll_due(100).is_empty());
    }

    #[test]
    fn test_manual_clock() {
        let signals = Signals::manual();
        signals.advance_to(50);
        signals.advance_to(40);
        assert_eq!(signals.now(), 50);

        signals.signal_now(9, 4);
        let fired = signals.poll_due(signals.now());
        assert_eq!(fired.len(), 1);
        assert_eq!((fired[0].stream_id, fired[0].signal), (9, 4));
    }
}
