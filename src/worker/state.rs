//! Service worker lifecycle as a pure state machine.
//!
//! Every event the host delivers maps to one call of [`transition`], which
//! returns the next state and the side effects to run before the next event
//! is accepted. The runner owns the effects; nothing in here touches I/O.

use crate::worker::model::{ControlMessage, FetchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePhase {
    Serving,
    Prefetching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Installing,
    WaitingToActivate,
    Active(ActivePhase),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Install,
    InstallComplete,
    Activate,
    Fetch(FetchRequest),
    Message(ControlMessage),
    PrefetchFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Activate as soon as installation ends instead of waiting for old
    /// instances to release their clients.
    SkipWaiting,
    ClaimClients,
    DeleteStalePartitions,
    EnsureStatus,
    Prefetch,
    NetworkFirst(FetchRequest),
    NetworkOnly(FetchRequest),
    ClearAllCaches,
    ResetStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: WorkerState,
    pub tasks: Vec<Task>,
}

impl Transition {
    fn to(next: WorkerState, tasks: Vec<Task>) -> Self {
        Self { next, tasks }
    }

    fn stay(state: WorkerState) -> Self {
        Self::to(state, Vec::new())
    }
}

pub fn transition(state: WorkerState, event: &WorkerEvent) -> Transition {
    use ActivePhase::{Prefetching, Serving};
    use WorkerState::{Active, Idle, Installing, WaitingToActivate};

    match (state, event) {
        (Idle, WorkerEvent::Install) => Transition::to(Installing, vec![Task::SkipWaiting]),
        (Installing, WorkerEvent::InstallComplete) => {
            Transition::to(WaitingToActivate, Vec::new())
        }
        (Installing | WaitingToActivate, WorkerEvent::Activate) => Transition::to(
            Active(Prefetching),
            vec![
                Task::ClaimClients,
                Task::DeleteStalePartitions,
                Task::EnsureStatus,
                Task::Prefetch,
            ],
        ),
        (Active(_), WorkerEvent::Fetch(request)) => {
            Transition::to(state, vec![Task::NetworkFirst(request.clone())])
        }
        (_, WorkerEvent::Fetch(request)) => {
            Transition::to(state, vec![Task::NetworkOnly(request.clone())])
        }
        (Active(Serving), WorkerEvent::Message(ControlMessage::CacheWarm)) => {
            Transition::to(Active(Prefetching), vec![Task::Prefetch])
        }
        (_, WorkerEvent::Message(ControlMessage::CacheWarm)) => Transition::stay(state),
        (_, WorkerEvent::Message(ControlMessage::ClearCache)) => {
            Transition::to(state, vec![Task::ClearAllCaches, Task::ResetStatus])
        }
        (Active(_), WorkerEvent::PrefetchFinished) => Transition::to(Active(Serving), Vec::new()),
        (
            _,
            WorkerEvent::Install
            | WorkerEvent::InstallComplete
            | WorkerEvent::Activate
            | WorkerEvent::PrefetchFinished,
        ) => Transition::stay(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_runs_install_then_activate() {
        let step = transition(WorkerState::Idle, &WorkerEvent::Install);
        assert_eq!(step.next, WorkerState::Installing);
        assert_eq!(step.tasks, vec![Task::SkipWaiting]);

        let step = transition(step.next, &WorkerEvent::InstallComplete);
        assert_eq!(step.next, WorkerState::WaitingToActivate);
        assert!(step.tasks.is_empty());

        let step = transition(step.next, &WorkerEvent::Activate);
        assert_eq!(step.next, WorkerState::Active(ActivePhase::Prefetching));
        assert_eq!(
            step.tasks,
            vec![
                Task::ClaimClients,
                Task::DeleteStalePartitions,
                Task::EnsureStatus,
                Task::Prefetch
            ]
        );

        let step = transition(step.next, &WorkerEvent::PrefetchFinished);
        assert_eq!(step.next, WorkerState::Active(ActivePhase::Serving));
    }

    #[test]
    fn activate_without_install_is_ignored() {
        let step = transition(WorkerState::Idle, &WorkerEvent::Activate);
        assert_eq!(step.next, WorkerState::Idle);
        assert!(step.tasks.is_empty());
    }

    #[test]
    fn fetch_is_network_first_only_when_active() {
        let request = FetchRequest::document("/docs");

        let step = transition(
            WorkerState::Active(ActivePhase::Serving),
            &WorkerEvent::Fetch(request.clone()),
        );
        assert_eq!(step.tasks, vec![Task::NetworkFirst(request.clone())]);

        let step = transition(WorkerState::Installing, &WorkerEvent::Fetch(request.clone()));
        assert_eq!(step.next, WorkerState::Installing);
        assert_eq!(step.tasks, vec![Task::NetworkOnly(request)]);
    }

    #[test]
    fn warm_request_during_prefetch_is_coalesced() {
        let warm = WorkerEvent::Message(ControlMessage::CacheWarm);

        let step = transition(WorkerState::Active(ActivePhase::Serving), &warm);
        assert_eq!(step.next, WorkerState::Active(ActivePhase::Prefetching));
        assert_eq!(step.tasks, vec![Task::Prefetch]);

        let step = transition(step.next, &warm);
        assert_eq!(step.next, WorkerState::Active(ActivePhase::Prefetching));
        assert!(step.tasks.is_empty());

        let step = transition(WorkerState::WaitingToActivate, &warm);
        assert!(step.tasks.is_empty());
    }

    #[test]
    fn clear_cache_is_accepted_in_any_state() {
        let clear = WorkerEvent::Message(ControlMessage::ClearCache);
        for state in [
            WorkerState::Idle,
            WorkerState::WaitingToActivate,
            WorkerState::Active(ActivePhase::Prefetching),
        ] {
            let step = transition(state, &clear);
            assert_eq!(step.next, state);
            assert_eq!(step.tasks, vec![Task::ClearAllCaches, Task::ResetStatus]);
        }
    }
}
