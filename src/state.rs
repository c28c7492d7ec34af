//! Process lifecycle state, tracked the same way the teacher tracks its own
//! startup sequence: a small atomic enum any task can poll without locking.

use std::sync::atomic::{AtomicU8, Ordering};

/// Application lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    Unknown = 0,
    Initializing = 1,
    LoadingKeys = 2,
    StartingNetwork = 3,
    Ready = 4,
    Terminating = 5,
}

impl From<u8> for ApplicationState {
    fn from(v: u8) -> Self {
        match v {
            1 => ApplicationState::Initializing,
            2 => ApplicationState::LoadingKeys,
            3 => ApplicationState::StartingNetwork,
            4 => ApplicationState::Ready,
            5 => ApplicationState::Terminating,
            _ => ApplicationState::Unknown,
        }
    }
}

/// Lock-free lifecycle tracker shared across the health/readiness handlers
/// and the main startup sequence.
#[derive(Debug, Default)]
pub struct LifecycleState {
    state: AtomicU8,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ApplicationState::Unknown as u8),
        }
    }

    pub fn set(&self, state: ApplicationState) {
        tracing::debug!(?state, "lifecycle state transition");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> ApplicationState {
        ApplicationState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.get(), ApplicationState::Terminating)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.get(), ApplicationState::Ready)
    }
}
