use serde_json::Value;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::backend::SystemOfRecord;
use crate::config::GatewayConfig;
use crate::messages::{self, Action, ReplyContext};
use crate::protocol::Message;

/// Reply to an inbound Call.
#[derive(Debug, Clone)]
pub struct Reply {
    pub action: String,
    pub message: Message,
    /// For bootstrap actions, whether the charge point was accepted
    pub boot_accepted: Option<bool>,
}

/// Builds replies for charge-point-initiated Calls.
///
/// Actions outside the catalogue, or ones a charge point may not send, get
/// a `NotImplemented` CallError. Everything else gets a protocol-valid
/// default unless the backend is consulted and supplies its own payload.
pub struct Responder {
    backend: Arc<dyn SystemOfRecord>,
    consult_backend: bool,
    backend_timeout: Duration,
    heartbeat_interval_secs: u32,
    next_transaction_id: AtomicI32,
}

impl Responder {
    pub fn new(backend: Arc<dyn SystemOfRecord>, cfg: &GatewayConfig) -> Self {
        Self {
            backend,
            consult_backend: cfg.consult_backend_replies,
            backend_timeout: cfg.backend_reply_timeout(),
            heartbeat_interval_secs: cfg.heartbeat_interval_secs,
            next_transaction_id: AtomicI32::new(1),
        }
    }

    pub async fn respond(&self, identity: &str, message_id: &str, action: &str, payload: &Value) -> Reply {
        let known = match Action::from_name(action) {
            Some(a) if a.sent_by_charge_point() => a,
            _ => {
                debug!(identity, message_id, action, "answering NotImplemented");
                return Reply {
                    action: action.to_string(),
                    message: Message::not_implemented(message_id, action),
                    boot_accepted: None,
                };
            }
        };

        let reply_payload = match self.consult(identity, known, payload).await {
            Some(p) => Some(p),
            None => messages::default_reply(known, self.context(known)),
        };
        let Some(reply_payload) = reply_payload else {
            return Reply {
                action: action.to_string(),
                message: Message::not_implemented(message_id, action),
                boot_accepted: None,
            };
        };

        let boot_accepted = known.is_bootstrap().then(|| messages::boot_accepted(&reply_payload));
        Reply {
            action: action.to_string(),
            message: Message::call_result(message_id, reply_payload),
            boot_accepted,
        }
    }

    fn context(&self, action: Action) -> ReplyContext {
        let transaction_id = if action == Action::StartTransaction {
            self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        ReplyContext {
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            transaction_id,
        }
    }

    async fn consult(&self, identity: &str, action: Action, payload: &Value) -> Option<Value> {
        if !self.consult_backend {
            return None;
        }
        match time::timeout(self.backend_timeout, self.backend.reply_for(identity, action.as_str(), payload)).await {
            Ok(Ok(Some(reply))) if reply.is_object() => Some(reply),
            Ok(Ok(Some(_))) => {
                warn!(identity, %action, "backend reply is not a JSON object, using default");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(identity, %action, error = %e, "backend reply lookup failed, using default");
                None
            }
            Err(_) => {
                warn!(
                    identity,
                    %action,
                    timeout_ms = self.backend_timeout.as_millis() as u64,
                    "backend reply lookup timed out, using default"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullSystemOfRecord;
    use crate::error::Result;
    use crate::forwarding::ForwardRecord;
    use crate::protocol::ErrorCode;
    use async_trait::async_trait;
    use serde_json::json;

    struct RejectingBackend;

    #[async_trait]
    impl SystemOfRecord for RejectingBackend {
        async fn deliver(&self, _record: &ForwardRecord) -> Result<()> {
            Ok(())
        }

        async fn reply_for(&self, _identity: &str, action: &str, _payload: &Value) -> Result<Option<Value>> {
            Ok(match action {
                "BootNotification" => Some(json!({
                    "status": "Rejected",
                    "currentTime": "2024-01-01T00:00:00.000Z",
                    "interval": 300
                })),
                _ => None,
            })
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl SystemOfRecord for SlowBackend {
        async fn deliver(&self, _record: &ForwardRecord) -> Result<()> {
            Ok(())
        }

        async fn reply_for(&self, _identity: &str, _action: &str, _payload: &Value) -> Result<Option<Value>> {
            time::sleep(Duration::from_secs(60)).await;
            Ok(Some(json!({"status": "Rejected"})))
        }
    }

    fn responder(backend: Arc<dyn SystemOfRecord>, consult: bool) -> Responder {
        let cfg = GatewayConfig {
            consult_backend_replies: consult,
            heartbeat_interval_secs: 120,
            ..GatewayConfig::default()
        };
        Responder::new(backend, &cfg)
    }

    #[tokio::test]
    async fn boot_notification_is_accepted_by_default() {
        let r = responder(Arc::new(NullSystemOfRecord), false);
        let reply = r
            .respond("CP-1", "19223201", "BootNotification", &json!({"chargePointVendor": "V", "chargePointModel": "M"}))
            .await;
        assert_eq!(reply.boot_accepted, Some(true));
        match reply.message {
            Message::CallResult { message_id, payload } => {
                assert_eq!(message_id, "19223201");
                assert_eq!(payload["status"], "Accepted");
                assert_eq!(payload["interval"], 120);
                assert!(payload["currentTime"].is_string());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_and_misdirected_actions_are_not_implemented() {
        let r = responder(Arc::new(NullSystemOfRecord), false);
        for action in ["FooBar", "RemoteStartTransaction"] {
            let reply = r.respond("CP-1", "m1", action, &json!({})).await;
            match reply.message {
                Message::CallError { message_id, error_code, error_description, error_details } => {
                    assert_eq!(message_id, "m1");
                    assert_eq!(error_code, ErrorCode::NotImplemented);
                    assert!(error_description.contains(action));
                    assert_eq!(error_details, json!({}));
                }
                other => panic!("unexpected reply {:?}", other),
            }
            assert_eq!(reply.boot_accepted, None);
        }
    }

    #[tokio::test]
    async fn transaction_ids_increase() {
        let r = responder(Arc::new(NullSystemOfRecord), false);
        let payload = json!({"connectorId": 1, "idTag": "ABC", "meterStart": 0, "timestamp": "2024-01-01T00:00:00Z"});
        let first = r.respond("CP-1", "a", "StartTransaction", &payload).await;
        let second = r.respond("CP-1", "b", "StartTransaction", &payload).await;
        assert_eq!(first.message.payload()["transactionId"], 1);
        assert_eq!(second.message.payload()["transactionId"], 2);
        assert_eq!(second.message.payload()["idTagInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn backend_reply_overrides_default() {
        let r = responder(Arc::new(RejectingBackend), true);
        let reply = r.respond("CP-1", "b1", "BootNotification", &json!({})).await;
        assert_eq!(reply.boot_accepted, Some(false));
        assert_eq!(reply.message.payload()["status"], "Rejected");

        // No opinion from the backend means the default.
        let reply = r.respond("CP-1", "h1", "Heartbeat", &json!({})).await;
        assert!(reply.message.payload()["currentTime"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_falls_back_to_default() {
        let r = responder(Arc::new(SlowBackend), true);
        let reply = r.respond("CP-1", "b2", "BootNotification", &json!({})).await;
        assert_eq!(reply.boot_accepted, Some(true));
    }
}
