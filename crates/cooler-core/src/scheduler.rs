//! Duty Scheduler: turns an accepted stream of [`ControlMessage`]s into a
//! stream of [`ValveCommand`]s.
//!
//! A two-phase on/off duty cycle driven by `ControlMessage.duty`, run as a
//! single-threaded timer-wheel task rather than ad-hoc sleep loops so
//! cancellation and phase-preservation stay easy to reason about.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::model::{ControlMessage, ControlState, Duty, ValveCommand};

/// Which half of the duty cycle is currently commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    On,
    Off,
}

/// Pure state machine: accepts messages and timer fires, emits valve
/// commands. Kept free of any actual I/O so it is unit-testable without a
/// broker or GPIO.
#[derive(Debug, Clone)]
pub struct Scheduler {
    last_applied_id: u64,
    phase: Phase,
    duty: Duty,
    deadline: Option<Instant>,
    /// Forced by the fault detector independent of the last received
    /// `ControlMessage`; while `true`, no ON phase may be emitted even if a
    /// fresh message enables duty.
    safe: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            last_applied_id: 0,
            phase: Phase::Off,
            duty: Duty::OFF,
            deadline: None,
            safe: false,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Called when the fault detector's SAFE posture changes. Entering SAFE
    /// immediately cancels any pending ON and forces close; leaving SAFE
    /// does not by itself resume duty — that happens on the next accepted
    /// `ControlMessage`, same as a reconnect after liveness loss.
    pub fn set_safe(&mut self, safe: bool, now: Instant) -> Option<ValveCommand> {
        if safe == self.safe {
            return None;
        }
        self.safe = safe;
        if safe {
            self.duty = Duty::OFF;
            self.phase = Phase::Off;
            self.deadline = None;
            Some(ValveCommand {
                open: false,
                deadline: now.into(),
            })
        } else {
            None
        }
    }

    pub fn last_applied_id(&self) -> u64 {
        self.last_applied_id
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Apply a freshly received control message (ordering already filtered
    /// by the caller's `message_id > last_applied_id` check would be
    /// redundant here — this method re-checks it itself so it is safe to
    /// call with any message).
    ///
    /// Returns the valve command to issue immediately, if any.
    pub fn accept(&mut self, msg: &ControlMessage, now: Instant) -> Option<ValveCommand> {
        if !msg.is_newer_than(self.last_applied_id) {
            return None;
        }
        self.last_applied_id = msg.message_id;

        if self.safe || msg.state == ControlState::Stopping || !msg.duty.enable {
            self.duty = Duty::OFF;
            self.phase = Phase::Off;
            self.deadline = None;
            return Some(ValveCommand {
                open: false,
                deadline: now.into(),
            });
        }

        let same_cycle = self.duty.same_cycle(&msg.duty) && self.duty.enable;
        self.duty = msg.duty;

        if same_cycle {
            // Preserve phase and whatever deadline is already running.
            if self.deadline.is_none() {
                self.deadline = Some(now + Duration::from_secs(self.phase_duration_sec() as u64));
            }
            None
        } else {
            // New cycle: always restart with an ON phase.
            self.phase = Phase::On;
            self.deadline = Some(now + Duration::from_secs(msg.duty.on_sec as u64));
            Some(ValveCommand {
                open: true,
                deadline: (now + Duration::from_secs(msg.duty.on_sec as u64)).into(),
            })
        }
    }

    fn phase_duration_sec(&self) -> u32 {
        match self.phase {
            Phase::On => self.duty.on_sec,
            Phase::Off => self.duty.off_sec,
        }
    }

    /// Called when the current phase's deadline elapses: flips phase,
    /// schedules the next deadline, and returns the inverse valve command.
    pub fn on_timer_fire(&mut self, now: Instant) -> Option<ValveCommand> {
        if !self.duty.enable {
            self.deadline = None;
            return None;
        }
        self.phase = match self.phase {
            Phase::On => Phase::Off,
            Phase::Off => Phase::On,
        };
        let dur = self.phase_duration_sec();
        self.deadline = Some(now + Duration::from_secs(dur as u64));
        Some(ValveCommand {
            open: self.phase == Phase::On,
            deadline: (now + Duration::from_secs(dur as u64)).into(),
        })
    }

    /// Shutdown or SAFE demotion: preempt the next deadline and force close.
    pub fn cancel(&mut self, now: Instant) -> ValveCommand {
        self.duty = Duty::OFF;
        self.phase = Phase::Off;
        self.deadline = None;
        ValveCommand {
            open: false,
            deadline: now.into(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a [`Scheduler`] from an incoming message channel plus its own
/// phase timer, writing every emitted command to a single-producer channel
/// into the valve driver. The scheduler is this channel's only producer by
/// construction — nothing else can reach the valve.
///
/// `inbox` is a `watch` channel rather than an `mpsc`: the subscriber's
/// single-slot, latest-wins mailbox is exactly `watch`'s semantics —
/// a message that arrives before the scheduler observes the previous one is
/// simply overwritten, never queued.
pub async fn run(
    mut inbox: watch::Receiver<Option<ControlMessage>>,
    mut safe: watch::Receiver<bool>,
    valve_tx: mpsc::Sender<ValveCommand>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut scheduler = Scheduler::new();
    let sleep = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(sleep);
    let mut deadline_armed = false;

    loop {
        if let Some(deadline) = scheduler.next_deadline() {
            sleep.as_mut().reset(deadline);
            deadline_armed = true;
        } else if deadline_armed {
            sleep.as_mut().reset(Instant::now() + Duration::from_secs(3600));
            deadline_armed = false;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                let cmd = scheduler.cancel(Instant::now());
                let _ = valve_tx.send(cmd).await;
                return;
            }
            changed = inbox.changed() => {
                if changed.is_err() {
                    return;
                }
                let msg = inbox.borrow_and_update().clone();
                if let Some(msg) = msg {
                    if let Some(cmd) = scheduler.accept(&msg, Instant::now()) {
                        let _ = valve_tx.send(cmd).await;
                    }
                }
            }
            () = &mut sleep, if deadline_armed => {
                if let Some(cmd) = scheduler.on_timer_fire(Instant::now()) {
                    let _ = valve_tx.send(cmd).await;
                }
            }
            changed = safe.changed() => {
                if changed.is_err() {
                    return;
                }
                let desired = *safe.borrow_and_update();
                if let Some(cmd) = scheduler.set_safe(desired, Instant::now()) {
                    let _ = valve_tx.send(cmd).await;
                }
            }
        }
    }
}
