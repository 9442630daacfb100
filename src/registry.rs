use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::session::{DisconnectReason, Session, SessionSnapshot};

/// What happened when a session was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No other session held the identity
    Fresh,
    /// An older session for the same identity was shut down first
    Superseded { previous_session_id: u64 },
    /// The registry is closed; the session was closed instead of installed
    Rejected,
}

/// Identity -> live session map.
///
/// At most one session per identity is registered at a time. Admission is
/// serialized so a superseded session has fully closed before its
/// replacement becomes visible.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    admission: tokio::sync::Mutex<()>,
    // Set once by `close_all`; later admissions are rejected with this reason.
    closed_with: Mutex<Option<DisconnectReason>>,
    supersede_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(supersede_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            closed_with: Mutex::new(None),
            supersede_timeout,
        }
    }

    /// Installs `session` under its identity and moves it to `AwaitingBoot`.
    ///
    /// Any session already registered for the identity is closed with
    /// [`DisconnectReason::Superseded`] and awaited for up to the supersede
    /// timeout. A prior session that does not finish in time is forced to
    /// `Closed`.
    ///
    /// Once [`close_all`](Self::close_all) has run, the session is closed
    /// with the same reason and [`Admission::Rejected`] is returned.
    pub async fn register(&self, session: Session) -> Admission {
        let _admission = self.admission.lock().await;
        if let Some(admission) = self.reject_if_closed(&session) {
            return admission;
        }
        let identity = session.identity().to_string();
        let prior = self.sessions.lock().get(&identity).cloned();

        let admission = match prior {
            Some(prior) => {
                info!(
                    identity = %identity,
                    previous_session_id = prior.id(),
                    session_id = session.id(),
                    "superseding existing session"
                );
                prior.close(DisconnectReason::Superseded);
                if time::timeout(self.supersede_timeout, prior.closed()).await.is_err() {
                    warn!(
                        identity = %identity,
                        previous_session_id = prior.id(),
                        timeout_ms = self.supersede_timeout.as_millis() as u64,
                        "superseded session did not close in time, forcing"
                    );
                    prior.finish();
                }
                Admission::Superseded { previous_session_id: prior.id() }
            }
            None => Admission::Fresh,
        };

        // The registry may have been closed while the prior session wound down.
        if let Some(admission) = self.reject_if_closed(&session) {
            return admission;
        }
        self.sessions.lock().insert(identity, session.clone());
        session.mark_registered();
        admission
    }

    fn reject_if_closed(&self, session: &Session) -> Option<Admission> {
        let reason = (*self.closed_with.lock())?;
        session.close(reason);
        info!(
            identity = %session.identity(),
            session_id = session.id(),
            ?reason,
            "registry closed, rejecting session"
        );
        Some(Admission::Rejected)
    }

    pub fn lookup(&self, identity: &str) -> Option<Session> {
        self.sessions.lock().get(identity).cloned()
    }

    /// Removes `session` if it is still the one registered for `identity`.
    pub fn unregister(&self, identity: &str, session: &Session) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(identity) {
            Some(current) if current.is_same(session) => {
                sessions.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snaps: Vec<SessionSnapshot> = self.sessions().iter().map(Session::snapshot).collect();
        snaps.sort_by(|a, b| a.identity.cmp(&b.identity));
        snaps
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Closes every registered session and stops admitting new ones.
    ///
    /// Waits for an admission already in progress, which is then rejected.
    pub async fn close_all(&self, reason: DisconnectReason) -> usize {
        self.closed_with.lock().get_or_insert(reason);
        // Closing first lets an admission blocked on a superseded session finish.
        let mut closed = self.close_registered(reason);
        let _admission = self.admission.lock().await;
        closed += self.close_registered(reason);
        closed
    }

    fn close_registered(&self, reason: DisconnectReason) -> usize {
        self.sessions().iter().filter(|s| s.close(reason)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;
    use crate::session::{SessionOptions, SessionState};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_moves_session_to_awaiting_boot() {
        let registry = SessionRegistry::new(Duration::from_secs(1));
        let (session, _frames) = test_session("CP-1", SessionOptions::default());
        assert_eq!(registry.register(session.clone()).await, Admission::Fresh);
        assert_eq!(session.state(), SessionState::AwaitingBoot);
        assert!(registry.lookup("CP-1").unwrap().is_same(&session));
        assert_eq!(registry.identities(), vec!["CP-1".to_string()]);
    }

    #[tokio::test]
    async fn prior_session_is_closed_before_replacement_is_visible() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(5)));
        let (old, _old_frames) = test_session("CP-2", SessionOptions::default());
        registry.register(old.clone()).await;
        old.mark_ready();
        let pending = old.enqueue("Reset", json!({"type": "Soft"})).unwrap();

        // Stand-in for the old connection task finishing its close.
        let mut state = old.subscribe_state();
        let closer = tokio::spawn({
            let old = old.clone();
            async move {
                let _ = state.wait_for(|s| *s == SessionState::Closing).await;
                old.finish();
            }
        });

        let (new, _new_frames) = test_session("CP-2", SessionOptions::default());
        let admission = registry.register(new.clone()).await;
        closer.await.unwrap();

        assert!(matches!(admission, Admission::Superseded { .. }));
        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(old.disconnect_reason(), Some(DisconnectReason::Superseded));
        assert_eq!(pending.wait().await, crate::correlation::CallOutcome::SessionClosed);
        assert!(registry.lookup("CP-2").unwrap().is_same(&new));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_prior_session_is_forced_closed() {
        let registry = SessionRegistry::new(Duration::from_millis(200));
        let (old, _old_frames) = test_session("CP-3", SessionOptions::default());
        registry.register(old.clone()).await;

        let (new, _new_frames) = test_session("CP-3", SessionOptions::default());
        registry.register(new.clone()).await;
        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(new.state(), SessionState::AwaitingBoot);
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_session() {
        let registry = SessionRegistry::new(Duration::from_millis(50));
        let (old, _a) = test_session("CP-4", SessionOptions::default());
        let (new, _b) = test_session("CP-4", SessionOptions::default());
        registry.register(old.clone()).await;
        registry.register(new.clone()).await;

        assert!(!registry.unregister("CP-4", &old));
        assert!(registry.lookup("CP-4").is_some());
        assert!(registry.unregister("CP-4", &new));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_rejects_admission_in_progress() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(5)));
        let (old, _old_frames) = test_session("CP-5", SessionOptions::default());
        registry.register(old.clone()).await;

        // The replacement blocks on the old session, which never finishes on its own.
        let (new, _new_frames) = test_session("CP-5", SessionOptions::default());
        let admitting = tokio::spawn({
            let registry = registry.clone();
            let new = new.clone();
            async move { registry.register(new).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(old.state(), SessionState::Closing);

        registry.close_all(DisconnectReason::Shutdown).await;
        assert_eq!(admitting.await.unwrap(), Admission::Rejected);
        assert_eq!(new.state(), SessionState::Closing);
        assert_eq!(new.disconnect_reason(), Some(DisconnectReason::Shutdown));
        assert!(!registry.lookup("CP-5").unwrap().is_same(&new));

        let (late, _late_frames) = test_session("CP-6", SessionOptions::default());
        assert_eq!(registry.register(late.clone()).await, Admission::Rejected);
        assert!(registry.lookup("CP-6").is_none());
        assert_eq!(late.disconnect_reason(), Some(DisconnectReason::Shutdown));
    }
}
