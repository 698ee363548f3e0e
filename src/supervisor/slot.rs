//! Per-slot worker state.
//!
//! ```text
//! Starting ──msg──▶ Running ──silent / crash──▶ TimedOut | Exited ──▶ Restarting ──msg──▶ Running
//!     │                │
//!     └──── Stop ──────┴──▶ Stopped
//! ```
//!
//! All transitions are pure; the pool does the killing and spawning.

use std::time::{Duration, Instant};

use super::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Spawned, nothing heard yet.
    Starting,
    Running,
    /// Killed for missing the liveness deadline.
    TimedOut,
    /// The worker went away without being told to stop.
    Exited,
    /// A replacement was spawned; nothing heard from it yet.
    Restarting,
    /// Sent the sentinel. Terminal.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub index: usize,
    state: SlotState,
    generation: u64,
    /// Liveness is measured from here. Set into the future while a worker
    /// starts so model loading does not count against it.
    last_activity: Instant,
    in_flight: Option<WorkItem>,
    restarts: usize,
}

impl WorkerSlot {
    pub fn new(index: usize, now: Instant, startup_grace: Duration) -> Self {
        Self {
            index,
            state: SlotState::Starting,
            generation: 0,
            last_activity: now + startup_grace,
            in_flight: None,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn in_flight(&self) -> Option<&WorkItem> {
        self.in_flight.as_ref()
    }

    /// A worker is supposed to be running in this slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            SlotState::Starting | SlotState::Running | SlotState::Restarting
        )
    }

    /// Down and waiting for a replacement.
    pub fn needs_restart(&self) -> bool {
        matches!(self.state, SlotState::TimedOut | SlotState::Exited)
    }

    /// Any message from the current worker proves it is alive.
    pub fn on_message(&mut self, now: Instant) {
        if self.is_live() {
            self.state = SlotState::Running;
        }
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn on_dispatch(&mut self, item: WorkItem) {
        self.in_flight = Some(item);
    }

    /// Clear the in-flight item if `item_id` is it. Returns whether it was.
    pub fn on_result(&mut self, item_id: i64) -> bool {
        match self.in_flight {
            Some(ref item) if item.id == item_id => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn on_stop_sent(&mut self) {
        self.state = SlotState::Stopped;
    }

    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.is_live() && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Returns the item the worker was holding.
    pub fn on_timeout(&mut self) -> Option<WorkItem> {
        self.state = SlotState::TimedOut;
        self.in_flight.take()
    }

    /// Returns the item the worker was holding. A stopped worker exiting is
    /// the expected end and changes nothing.
    pub fn on_exit(&mut self) -> Option<WorkItem> {
        if self.state == SlotState::Stopped {
            return None;
        }
        self.state = SlotState::Exited;
        self.in_flight.take()
    }

    /// Move to a new generation before spawning its worker.
    pub fn begin_restart(&mut self, now: Instant, startup_grace: Duration) -> u64 {
        self.state = SlotState::Restarting;
        self.generation += 1;
        self.restarts += 1;
        self.last_activity = now + startup_grace;
        self.generation
    }

    /// The replacement could not be spawned.
    pub fn on_spawn_failed(&mut self) {
        self.state = SlotState::Exited;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64) -> WorkItem {
        WorkItem { id, path: format!("{}.jpg", id).into() }
    }

    #[test]
    fn test_startup_grace_delays_liveness() {
        let t0 = Instant::now();
        let slot = WorkerSlot::new(0, t0, Duration::from_secs(30));
        let timeout = Duration::from_secs(10);

        assert!(!slot.is_overdue(t0 + Duration::from_secs(35), timeout));
        assert!(slot.is_overdue(t0 + Duration::from_secs(41), timeout));
    }

    #[test]
    fn test_timeout_and_restart() {
        let t0 = Instant::now();
        let mut slot = WorkerSlot::new(1, t0, Duration::ZERO);
        slot.on_message(t0);
        assert_eq!(slot.state(), SlotState::Running);

        slot.on_dispatch(item(5));
        let timeout = Duration::from_secs(10);
        let late = t0 + Duration::from_secs(11);
        assert!(slot.is_overdue(late, timeout));

        assert_eq!(slot.on_timeout(), Some(item(5)));
        assert_eq!(slot.state(), SlotState::TimedOut);
        assert!(slot.needs_restart());
        assert!(!slot.is_overdue(late, timeout));

        let generation = slot.begin_restart(late, Duration::from_secs(5));
        assert_eq!(generation, 1);
        assert_eq!(slot.restarts(), 1);
        assert_eq!(slot.state(), SlotState::Restarting);
        assert!(!slot.is_overdue(late + Duration::from_secs(12), timeout));

        slot.on_message(late + Duration::from_secs(1));
        assert_eq!(slot.state(), SlotState::Running);
    }

    #[test]
    fn test_results_clear_only_their_item() {
        let mut slot = WorkerSlot::new(0, Instant::now(), Duration::ZERO);
        slot.on_dispatch(item(1));
        assert!(!slot.on_result(2));
        assert!(slot.on_result(1));
        assert!(slot.in_flight().is_none());
        assert!(!slot.on_result(1));
    }

    #[test]
    fn test_exit_after_stop_is_clean() {
        let mut slot = WorkerSlot::new(0, Instant::now(), Duration::ZERO);
        slot.on_stop_sent();
        assert_eq!(slot.on_exit(), None);
        assert_eq!(slot.state(), SlotState::Stopped);
        assert!(!slot.is_live());
        assert!(!slot.needs_restart());

        let mut crashed = WorkerSlot::new(1, Instant::now(), Duration::ZERO);
        crashed.on_dispatch(item(3));
        assert_eq!(crashed.on_exit(), Some(item(3)));
        assert!(crashed.needs_restart());
    }
}
