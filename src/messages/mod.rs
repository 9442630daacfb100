//! OCPP 1.6 action catalogue and the payloads the gateway answers with.
//!
//! The [`Action`] enum is generated by `build.rs` from
//! `ocpp_dictionaries/ocpp16j.json`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of the connection may originate an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    ChargePoint,
    CentralSystem,
    Both,
}

include!(concat!(env!("OUT_DIR"), "/actions.rs"));

impl Action {
    pub fn sent_by_charge_point(&self) -> bool {
        matches!(self.initiator(), Initiator::ChargePoint | Initiator::Both)
    }

    pub fn sent_by_central_system(&self) -> bool {
        matches!(self.initiator(), Initiator::CentralSystem | Initiator::Both)
    }
}

impl std::str::FromStr for Action {
    type Err = crate::error::OcppgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::from_name(s).ok_or_else(|| crate::error::OcppgError::UnknownAction(s.to_string()))
    }
}

/// ISO-8601 UTC timestamp with millisecond precision, as charge points expect it.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationConf {
    pub status: RegistrationStatus,
    pub current_time: String,
    pub interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConf {
    pub current_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeConf {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionConf {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferConf {
    pub status: String,
}

/// Inputs a default reply may depend on.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext {
    pub heartbeat_interval_secs: u32,
    pub transaction_id: i32,
}

/// Protocol-valid reply payload for a charge-point-initiated action.
///
/// Returns `None` for actions a charge point may not send.
pub fn default_reply(action: Action, ctx: ReplyContext) -> Option<Value> {
    let accepted = || IdTagInfo { status: AuthorizationStatus::Accepted };
    let payload = match action {
        Action::BootNotification => serde_json::to_value(BootNotificationConf {
            status: RegistrationStatus::Accepted,
            current_time: now_timestamp(),
            interval: ctx.heartbeat_interval_secs,
        }),
        Action::Heartbeat => serde_json::to_value(HeartbeatConf { current_time: now_timestamp() }),
        Action::Authorize => serde_json::to_value(AuthorizeConf { id_tag_info: accepted() }),
        Action::StartTransaction => serde_json::to_value(StartTransactionConf {
            id_tag_info: accepted(),
            transaction_id: ctx.transaction_id,
        }),
        Action::DataTransfer => {
            serde_json::to_value(DataTransferConf { status: "Accepted".to_string() })
        }
        Action::StopTransaction
        | Action::StatusNotification
        | Action::MeterValues
        | Action::DiagnosticsStatusNotification
        | Action::FirmwareStatusNotification => Ok(crate::protocol::empty_object()),
        _ => return None,
    };
    payload.ok()
}

/// Whether a BootNotification reply payload accepts the charge point.
pub fn boot_accepted(payload: &Value) -> bool {
    payload.get("status").and_then(Value::as_str) == Some("Accepted")
}
