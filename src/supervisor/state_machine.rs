//! Lifecycle state machine of a supervised unit.
//!
//! Flattened representation of the unit lifecycle: a tagged `Phase` plus the
//! `restart_expected` and `kill_requested` flags. `StateMachine::handle` is a
//! pure transition function; it never touches processes or watchers itself but
//! returns the `Action`s the supervisor must run, in order.
//!
//! ```text
//! Idle -> Setup -> Starting -> Accessible <-> Restarting
//!                     |            |             |
//!                     +--> Failed <+-------------+
//!           (any) --KillRequested--> Killing -> Killed
//! ```

use super::error::ModuleError;
use crate::protocol::ModuleReady;

/// Whether the worker of an `Accessible`/`Restarting` unit is still alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStage {
    StoppingWorker,
    StoppingWatcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Setup,
    Starting,
    Accessible(Child),
    /// `Restarting(Exited)` is transient: it always hops to `Starting`
    /// within the same `handle` call.
    Restarting(Child),
    Failed,
    Killing(KillStage),
    Killed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    WatcherReady,
    ModuleChanged,
    RestartRequested,
    Ready(ModuleReady),
    ProcessExited { crashed: bool },
    KillRequested,
    WatcherStopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartWatcher,
    StopWatcher,
    SpawnWorker,
    StopWorker,
    ResolveHandle(ModuleReady),
    RejectHandle(ModuleError),
    RecreateHandle,
    /// Release buffered calls, or discard them when the module is a value
    FlushPending(ModuleReady),
    DiscardBuffered(ModuleError),
    NotifyKilled,
    LogReady,
    LogRestarting,
    LogFailed,
    LogCannotRestart,
}

#[derive(Debug)]
pub struct StateMachine {
    phase: Phase,
    restart_expected: bool,
    kill_requested: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            restart_expected: false,
            kill_requested: false,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restart_expected(&self) -> bool {
        self.restart_expected
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested
    }

    pub fn is_accessible(&self) -> bool {
        matches!(self.phase, Phase::Accessible(_))
    }

    /// Accessible with a live worker that can take invocations
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Accessible(Child::Running)
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    pub fn is_killed(&self) -> bool {
        self.phase == Phase::Killed
    }

    /// Process one event to completion and return the side effects to run.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use Action::*;

        let from = self.phase;
        let mut actions = Vec::new();

        if event == Event::KillRequested && !matches!(from, Phase::Killing(_) | Phase::Killed) {
            self.kill_requested = true;
        }

        let target = match (from, event) {
            (Phase::Idle, Event::Start) => {
                actions.push(StartWatcher);
                Some(Phase::Setup)
            }
            (Phase::Idle, Event::KillRequested) => {
                actions.extend(reject_unavailable());
                actions.push(NotifyKilled);
                Some(Phase::Killed)
            }

            (Phase::Setup, Event::WatcherReady) => {
                actions.push(SpawnWorker);
                Some(Phase::Starting)
            }
            (Phase::Setup, Event::KillRequested) => {
                actions.extend(reject_unavailable());
                actions.push(StopWatcher);
                Some(Phase::Killing(KillStage::StoppingWatcher))
            }

            (Phase::Starting, Event::ModuleChanged | Event::RestartRequested) => {
                self.restart_expected = true;
                None
            }
            (Phase::Starting, Event::Ready(ready)) => {
                if self.restart_expected {
                    actions.extend([LogRestarting, RecreateHandle, StopWorker]);
                    Some(Phase::Restarting(Child::Running))
                } else {
                    actions.extend([ResolveHandle(ready.clone()), LogReady, FlushPending(ready)]);
                    Some(Phase::Accessible(Child::Running))
                }
            }
            (Phase::Starting, Event::ProcessExited { .. }) => {
                actions.extend(fail());
                Some(Phase::Failed)
            }
            (Phase::Starting, Event::KillRequested) => {
                actions.extend(reject_unavailable());
                actions.push(StopWorker);
                Some(Phase::Killing(KillStage::StoppingWorker))
            }

            (Phase::Accessible(Child::Running), Event::ModuleChanged | Event::RestartRequested) => {
                actions.extend([LogRestarting, RecreateHandle, StopWorker]);
                Some(Phase::Restarting(Child::Running))
            }
            (Phase::Accessible(Child::Running), Event::ProcessExited { crashed: true }) => {
                actions.extend(fail());
                Some(Phase::Failed)
            }
            (Phase::Accessible(Child::Running), Event::ProcessExited { crashed: false }) => {
                Some(Phase::Accessible(Child::Exited))
            }
            (Phase::Accessible(Child::Running), Event::KillRequested) => {
                actions.extend([DiscardBuffered(ModuleError::Unavailable), StopWorker]);
                Some(Phase::Killing(KillStage::StoppingWorker))
            }

            (Phase::Accessible(Child::Exited), Event::ModuleChanged | Event::RestartRequested) => {
                actions.extend([LogRestarting, RecreateHandle]);
                Some(Phase::Restarting(Child::Exited))
            }
            (Phase::Accessible(Child::Exited), Event::KillRequested) => {
                actions.extend([DiscardBuffered(ModuleError::Unavailable), StopWatcher]);
                Some(Phase::Killing(KillStage::StoppingWatcher))
            }

            (Phase::Restarting(Child::Running), Event::ProcessExited { crashed: true }) => {
                actions.extend(fail());
                Some(Phase::Failed)
            }
            (Phase::Restarting(Child::Running), Event::ProcessExited { crashed: false }) => {
                Some(Phase::Restarting(Child::Exited))
            }
            (Phase::Restarting(_), Event::KillRequested) => {
                // stop already in flight
                actions.extend(reject_unavailable());
                Some(Phase::Killing(KillStage::StoppingWorker))
            }

            (Phase::Failed, Event::ModuleChanged | Event::RestartRequested) => {
                actions.extend([LogRestarting, RecreateHandle]);
                Some(Phase::Restarting(Child::Exited))
            }
            (Phase::Failed, Event::KillRequested) => {
                actions.extend([DiscardBuffered(ModuleError::Unavailable), StopWatcher]);
                Some(Phase::Killing(KillStage::StoppingWatcher))
            }

            (Phase::Killing(KillStage::StoppingWorker), Event::ProcessExited { .. }) => {
                actions.push(StopWatcher);
                Some(Phase::Killing(KillStage::StoppingWatcher))
            }
            (Phase::Killing(KillStage::StoppingWatcher), Event::WatcherStopped) => {
                actions.push(NotifyKilled);
                Some(Phase::Killed)
            }
            (Phase::Killing(_) | Phase::Killed, Event::RestartRequested) => {
                actions.push(LogCannotRestart);
                None
            }

            _ => None,
        };

        let Some(mut target) = target else {
            return actions;
        };

        if target == Phase::Restarting(Child::Exited) {
            actions.push(SpawnWorker);
            target = Phase::Starting;
        }

        if from == Phase::Starting && target != Phase::Starting {
            self.restart_expected = false;
        }

        tracing::debug!("State transition: {:?} -> {:?}", from, target);
        self.phase = target;
        actions
    }
}

fn reject_unavailable() -> [Action; 2] {
    [
        Action::RejectHandle(ModuleError::Unavailable),
        Action::DiscardBuffered(ModuleError::Unavailable),
    ]
}

fn fail() -> [Action; 2] {
    [Action::LogFailed, Action::RejectHandle(ModuleError::UnexpectedExit)]
}
