//! Tick-counted alarm.
//!
//! The alarm arms once a condition has held on `required` consecutive
//! ticks and stays armed until a tick reports the condition gone. Pool
//! failover keeps one per pool so a single slow probe never moves devices.
//!
//! ```text
//!   tick(false)        tick(true), n < required
//!  ┌────┐             ┌────┐
//!  ▼    │  tick(true) ▼    │    n == required
//! Clear ────────────► Building ───────────────► Armed ◄─┐
//!  ▲                    │                        │  │   │ tick(true)
//!  │    tick(false)     │                        │  └───┘
//!  ├────────────────────┘                        │
//!  │              tick(false) or reset()         │
//!  └─────────────────────────────────────────────┘
//! ```

/// What a tick did to the alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmStatus {
    /// Nothing wrong.
    Idle,
    /// Condition seen, not yet for long enough.
    Pending,
    /// Armed on this tick. Reported once per episode.
    Triggered,
    /// Armed earlier and the condition persists.
    Active,
    /// Was armed; the condition just cleared. Reported once.
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Clear,
    Building(u32),
    Armed,
}

/// Counts consecutive ticks of a condition and arms on the `required`th.
#[derive(Debug, Clone)]
pub struct DebouncedAlarm {
    required: u32,
    phase: Phase,
}

impl DebouncedAlarm {
    /// `required` of 0 arms on the first tick, same as 1.
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            phase: Phase::Clear,
        }
    }

    /// Feed one tick. A false tick always discards the running count.
    pub fn tick(&mut self, condition: bool) -> AlarmStatus {
        let (phase, status) = match (self.phase, condition) {
            (Phase::Armed, true) => (Phase::Armed, AlarmStatus::Active),
            (Phase::Armed, false) => (Phase::Clear, AlarmStatus::Resolved),
            (_, false) => (Phase::Clear, AlarmStatus::Idle),
            (Phase::Clear, true) => self.count(1),
            (Phase::Building(n), true) => self.count(n + 1),
        };
        self.phase = phase;
        status
    }

    fn count(&self, n: u32) -> (Phase, AlarmStatus) {
        if n < self.required {
            (Phase::Building(n), AlarmStatus::Pending)
        } else {
            (Phase::Armed, AlarmStatus::Triggered)
        }
    }

    /// Consecutive true ticks so far, saturating at `required`.
    pub fn consecutive(&self) -> u32 {
        match self.phase {
            Phase::Clear => 0,
            Phase::Building(n) => n,
            Phase::Armed => self.required,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.phase == Phase::Armed
    }

    /// Disarm and forget the count.
    pub fn reset(&mut self) {
        self.phase = Phase::Clear;
    }
}
