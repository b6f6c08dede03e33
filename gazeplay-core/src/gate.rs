//! # Frame Gate - Backpressure Between Decoder and Consumer
//!
//! A counting semaphore over published frames. The decode thread takes a
//! permit before publishing a frame and the permit travels with the frame;
//! the consumer gives it back by releasing (or dropping) the frame. Once
//! `capacity` frames are out the decode thread blocks until one comes back
//! or the session is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How often a blocked acquire rechecks its cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(20);

pub const DEFAULT_CAPACITY: usize = 64;

struct GateState {
    capacity: usize,
    in_flight: Mutex<usize>,
    space_cond: Condvar,
}

impl GateState {
    fn release_one(&self) {
        let mut in_flight = self.in_flight.lock();
        if *in_flight == 0 {
            tracing::warn!("Frame gate released more often than acquired");
            return;
        }
        *in_flight -= 1;
        drop(in_flight);
        self.space_cond.notify_one();
    }
}

/// Shared handle to the gate. Clones refer to the same counter.
#[derive(Clone)]
pub struct FrameGate {
    state: Arc<GateState>,
}

impl std::fmt::Debug for FrameGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGate")
            .field("capacity", &self.state.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl FrameGate {
    /// A gate with room for `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(GateState {
                capacity: capacity.max(1),
                in_flight: Mutex::new(0),
                space_cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Frames published and not yet released
    pub fn in_flight(&self) -> usize {
        *self.state.in_flight.lock()
    }

    fn permit(&self) -> GatePermit {
        GatePermit {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Take a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let mut in_flight = self.state.in_flight.lock();
        if *in_flight >= self.state.capacity {
            return None;
        }
        *in_flight += 1;
        Some(self.permit())
    }

    /// Wait up to `timeout` for a permit.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<GatePermit> {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.state.in_flight.lock();

        while *in_flight >= self.state.capacity {
            if self.state.space_cond.wait_until(&mut in_flight, deadline).timed_out()
                && *in_flight >= self.state.capacity
            {
                return None;
            }
        }
        *in_flight += 1;
        Some(self.permit())
    }

    /// Wait for a permit until one frees up or `cancel` is set. Returns
    /// `None` only when cancelled.
    pub fn acquire(&self, cancel: &AtomicBool) -> Option<GatePermit> {
        let mut in_flight = self.state.in_flight.lock();
        let mut warned = false;

        while *in_flight >= self.state.capacity {
            if cancel.load(Ordering::Acquire) {
                return None;
            }
            if !warned {
                tracing::debug!("Frame gate full ({} in flight), waiting", *in_flight);
                warned = true;
            }
            self.state.space_cond.wait_for(&mut in_flight, CANCEL_POLL);
        }
        *in_flight += 1;
        Some(self.permit())
    }

    /// Wake every blocked acquirer so it rechecks its cancel flag.
    pub fn wake_all(&self) {
        self.state.space_cond.notify_all();
    }
}

impl Default for FrameGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One slot of the gate. Released on [`GatePermit::release`] or drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct GatePermit {
    state: Option<Arc<GateState>>,
}

impl GatePermit {
    pub fn release(mut self) {
        if let Some(state) = self.state.take() {
            state.release_one();
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.release_one();
        }
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GatePermit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_capacity_is_enforced() {
        let gate = FrameGate::new(3);
        let permits: Vec<_> = (0..3).map(|_| gate.try_acquire().unwrap()).collect();
        assert_eq!(gate.in_flight(), 3);
        assert!(gate.try_acquire().is_none());
        assert!(gate.acquire_timeout(Duration::from_millis(10)).is_none());

        drop(permits);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_explicit_release() {
        let gate = FrameGate::new(1);
        let permit = gate.try_acquire().unwrap();
        permit.release();
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_blocked_acquire_resumes_on_release() {
        let gate = FrameGate::new(1);
        let held = gate.try_acquire().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = gate.clone();
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || gate.acquire(&cancel).map(|p| p.release()).is_some())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        held.release();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_cancel_unblocks_acquire() {
        let gate = FrameGate::new(1);
        let _held = gate.try_acquire().unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = gate.clone();
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || gate.acquire(&cancel).is_none())
        };

        thread::sleep(Duration::from_millis(30));
        cancel.store(true, Ordering::Release);
        gate.wake_all();
        assert!(waiter.join().unwrap());
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(FrameGate::new(0).capacity(), 1);
        assert_eq!(FrameGate::default().capacity(), DEFAULT_CAPACITY);
    }
}
