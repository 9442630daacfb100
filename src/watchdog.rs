use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::WatchdogConfig;
use crate::registry::SessionRegistry;
use crate::session::DisconnectReason;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_calls: usize,
    pub probes_sent: usize,
    pub evicted: Vec<String>,
}

/// Periodic liveness and call-deadline enforcement.
///
/// A session silent for the liveness interval gets a WebSocket ping. One
/// silent for twice the interval is faulted and removed from the registry.
/// Every tick also times out overdue Calls.
pub struct Watchdog {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    tick: Duration,
}

impl Watchdog {
    pub fn new(registry: Arc<SessionRegistry>, cfg: &WatchdogConfig) -> Self {
        Self {
            registry,
            interval: cfg.interval(),
            tick: cfg.tick(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep(Instant::now());
                if report != SweepReport::default() {
                    debug!(
                        expired_calls = report.expired_calls,
                        probes_sent = report.probes_sent,
                        evicted = report.evicted.len(),
                        "watchdog sweep"
                    );
                }
            }
        })
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for session in self.registry.sessions() {
            report.expired_calls += session.expire_due(now).len();

            let idle = session.idle(now);
            if idle >= self.interval * 2 {
                if session.fault(DisconnectReason::LivenessTimeout) {
                    warn!(
                        identity = %session.identity(),
                        session_id = session.id(),
                        idle_ms = idle.as_millis() as u64,
                        "no traffic from charge point, evicting"
                    );
                }
                self.registry.unregister(session.identity(), &session);
                report.evicted.push(session.identity().to_string());
            } else if idle >= self.interval && session.probe() {
                debug!(identity = %session.identity(), idle_ms = idle.as_millis() as u64, "liveness probe sent");
                report.probes_sent += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CallOutcome;
    use crate::session::tests::test_session;
    use crate::session::{OutboundFrame, SessionOptions, SessionState};
    use serde_json::json;

    fn watchdog(registry: &Arc<SessionRegistry>) -> Watchdog {
        Watchdog::new(
            Arc::clone(registry),
            &WatchdogConfig { interval_ms: 1_000, tick_ms: 100 },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_probed_then_evicted() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(1)));
        let (session, mut frames) = test_session("CP-1", SessionOptions::default());
        registry.register(session.clone()).await;
        let dog = watchdog(&registry);

        assert_eq!(dog.sweep(Instant::now()), SweepReport::default());

        time::advance(Duration::from_millis(1_100)).await;
        let report = dog.sweep(Instant::now());
        assert_eq!(report.probes_sent, 1);
        assert!(matches!(frames.try_recv(), Ok(OutboundFrame::Ping(_))));

        // A second sweep does not stack probes.
        assert_eq!(dog.sweep(Instant::now()).probes_sent, 0);

        time::advance(Duration::from_millis(1_000)).await;
        let report = dog.sweep(Instant::now());
        assert_eq!(report.evicted, vec!["CP-1".to_string()]);
        assert_eq!(session.state(), SessionState::Faulted);
        assert_eq!(session.disconnect_reason(), Some(DisconnectReason::LivenessTimeout));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_session_alive() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(1)));
        let (session, _frames) = test_session("CP-2", SessionOptions::default());
        registry.register(session.clone()).await;
        let dog = watchdog(&registry);

        for _ in 0..5 {
            time::advance(Duration::from_millis(900)).await;
            session.touch();
            assert_eq!(dog.sweep(Instant::now()), SweepReport::default());
        }
        assert_eq!(session.state(), SessionState::AwaitingBoot);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_calls_time_out_on_sweep() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(1)));
        let options = SessionOptions { call_timeout: Duration::from_millis(500), ..SessionOptions::default() };
        let (session, _frames) = test_session("CP-3", options);
        registry.register(session.clone()).await;
        session.mark_ready();
        let ticket = session.enqueue("Reset", json!({"type": "Soft"})).unwrap();

        time::advance(Duration::from_millis(600)).await;
        session.touch();
        let report = watchdog(&registry).sweep(Instant::now());
        assert_eq!(report.expired_calls, 1);
        assert_eq!(ticket.wait().await, CallOutcome::Timeout);
        assert_eq!(session.pending_calls(), 0);
    }
}
