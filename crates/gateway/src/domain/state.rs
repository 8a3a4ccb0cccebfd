//! Klippy host session state.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of the host session.
///
/// `Connecting` covers the window between socket accept and the first
/// registration message; `Initializing` lasts until the host declares
/// itself ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KlippyState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Shutdown,
}

impl KlippyState {
    /// Value broadcast in `notify_klippy_state_changed`, if this state is
    /// announced to clients.
    pub fn notification(&self) -> Option<&'static str> {
        match self {
            KlippyState::Ready => Some("ready"),
            KlippyState::Shutdown => Some("shutdown"),
            KlippyState::Disconnected => Some("disconnect"),
            KlippyState::Connecting | KlippyState::Initializing => None,
        }
    }
}

/// Single-writer state cell with change notification.
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<KlippyState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(KlippyState::Disconnected);
        Self { tx }
    }

    /// Transition to a new state. Returns false if already there.
    pub fn set(&self, state: KlippyState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    pub fn current(&self) -> KlippyState {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.current() == KlippyState::Ready
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<KlippyState> {
        self.tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_report_change() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.current(), KlippyState::Disconnected);
        assert!(tracker.set(KlippyState::Connecting));
        assert!(!tracker.set(KlippyState::Connecting));
        assert!(tracker.set(KlippyState::Ready));
        assert!(tracker.is_ready());
    }

    #[test]
    fn test_notification_names() {
        assert_eq!(KlippyState::Ready.notification(), Some("ready"));
        assert_eq!(KlippyState::Shutdown.notification(), Some("shutdown"));
        assert_eq!(KlippyState::Disconnected.notification(), Some("disconnect"));
        assert_eq!(KlippyState::Connecting.notification(), None);
    }

    #[tokio::test]
    async fn test_watchers_observe_transitions() {
        let tracker = StateTracker::new();
        let mut rx = tracker.watch();
        tracker.set(KlippyState::Ready);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), KlippyState::Ready);
    }
}
