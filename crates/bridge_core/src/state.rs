use std::sync::Arc;

use shared::domain::{ConnectionMode, ConnectionState};
use tokio::sync::{Mutex, MutexGuard};

use crate::lookup::LookupGuard;

/// What one poll cycle saw at the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub registered: bool,
    pub mode: ConnectionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    LoggedIn,
    LoggedOut,
    /// Still registered, but against a different endpoint.
    Moved,
    /// Endpoint changed while unregistered.
    Reconfigured,
}

impl Transition {
    pub fn needs_setup(self) -> bool {
        matches!(self, Self::LoggedIn | Self::Moved)
    }

    pub fn needs_teardown(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Moved)
    }
}

pub fn transition(previous: &ConnectionState, observed: &Observation) -> Transition {
    match (previous.registered, observed.registered) {
        (false, true) => Transition::LoggedIn,
        (true, false) => Transition::LoggedOut,
        _ if previous.mode == observed.mode => Transition::Unchanged,
        (true, true) => Transition::Moved,
        (false, false) => Transition::Reconfigured,
    }
}

pub(crate) struct HubInner {
    pub(crate) state: ConnectionState,
    /// Mode the next registration attempt should use.
    pub(crate) configured_mode: ConnectionMode,
    pub(crate) lookup: Option<Arc<LookupGuard>>,
}

/// The one holder of mutable connection state. The same lock covers the
/// lookup handle's lifecycle, since both change together on login/logout.
pub struct ConnectionHub {
    inner: Mutex<HubInner>,
}

impl ConnectionHub {
    pub fn new(enabled: bool, mode: ConnectionMode) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                state: ConnectionState::new(enabled, mode.clone()),
                configured_mode: mode,
                lookup: None,
            }),
        }
    }

    pub async fn snapshot(&self) -> ConnectionState {
        self.inner.lock().await.state.clone()
    }

    /// The enabled flag and the mode registration should use.
    pub async fn desired(&self) -> (bool, ConnectionMode) {
        let guard = self.inner.lock().await;
        (guard.state.enabled, guard.configured_mode.clone())
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.lock().await.state.enabled = enabled;
    }

    pub async fn apply_settings(&self, enabled: bool, mode: ConnectionMode) {
        let mut guard = self.inner.lock().await;
        guard.state.enabled = enabled;
        guard.configured_mode = mode;
    }

    pub async fn lookup(&self) -> Option<Arc<LookupGuard>> {
        self.inner.lock().await.lookup.clone()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(registered: bool, mode: ConnectionMode) -> ConnectionState {
        ConnectionState {
            enabled: true,
            registered,
            mode,
        }
    }

    fn seen(registered: bool, mode: ConnectionMode) -> Observation {
        Observation { registered, mode }
    }

    #[test]
    fn identical_observation_is_unchanged() {
        let previous = state(true, ConnectionMode::Local);
        assert_eq!(
            transition(&previous, &seen(true, ConnectionMode::Local)),
            Transition::Unchanged
        );
        let previous = state(false, ConnectionMode::Remote("a".into()));
        assert_eq!(
            transition(&previous, &seen(false, ConnectionMode::Remote("a".into()))),
            Transition::Unchanged
        );
    }

    #[test]
    fn registration_edges() {
        let down = state(false, ConnectionMode::Local);
        let up = state(true, ConnectionMode::Local);
        assert_eq!(
            transition(&down, &seen(true, ConnectionMode::Local)),
            Transition::LoggedIn
        );
        assert_eq!(
            transition(&up, &seen(false, ConnectionMode::Local)),
            Transition::LoggedOut
        );
        assert!(Transition::LoggedIn.needs_setup());
        assert!(!Transition::LoggedIn.needs_teardown());
        assert!(Transition::LoggedOut.needs_teardown());
    }

    #[test]
    fn mode_changes() {
        let up = state(true, ConnectionMode::Local);
        let moved = transition(&up, &seen(true, ConnectionMode::Remote("b".into())));
        assert_eq!(moved, Transition::Moved);
        assert!(moved.needs_setup() && moved.needs_teardown());

        let down = state(false, ConnectionMode::Remote("a".into()));
        let reconfigured = transition(&down, &seen(false, ConnectionMode::Remote("b".into())));
        assert_eq!(reconfigured, Transition::Reconfigured);
        assert!(!reconfigured.needs_setup() && !reconfigured.needs_teardown());
    }

    #[tokio::test]
    async fn settings_update_enabled_and_desired_mode_only() {
        let hub = ConnectionHub::new(true, ConnectionMode::Local);
        hub.apply_settings(false, ConnectionMode::Remote("10.0.0.2".into()))
            .await;

        let (enabled, mode) = hub.desired().await;
        assert!(!enabled);
        assert_eq!(mode, ConnectionMode::Remote("10.0.0.2".into()));
        // Observed mode changes only when the monitor sees it.
        assert_eq!(hub.snapshot().await.mode, ConnectionMode::Local);
    }
}
