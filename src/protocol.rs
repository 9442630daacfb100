use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const CALL: u64 = 2;
pub const CALL_RESULT: u64 = 3;
pub const CALL_ERROR: u64 = 4;

/// The first element of every OCPP-J envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTypeId {
    Call,        // 2
    CallResult,  // 3
    CallError,   // 4
}

impl MessageTypeId {
    pub fn as_u64(&self) -> u64 {
        match self {
            MessageTypeId::Call => CALL,
            MessageTypeId::CallResult => CALL_RESULT,
            MessageTypeId::CallError => CALL_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTypeId::Call => "Call",
            MessageTypeId::CallResult => "CallResult",
            MessageTypeId::CallError => "CallError",
        }
    }
}

/// OCPP-J CallError codes. Codes outside the standard set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> ErrorCode {
        match s {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => ErrorCode::OccurenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "GenericError" => ErrorCode::GenericError,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded OCPP-J envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        error_code: ErrorCode,
        error_description: String,
        error_details: Value,
    },
}

impl Message {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Message::Call { message_id: message_id.into(), action: action.into(), payload }
    }

    pub fn call_result(message_id: impl Into<String>, payload: Value) -> Self {
        Message::CallResult { message_id: message_id.into(), payload }
    }

    pub fn call_error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Message::CallError {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: empty_object(),
        }
    }

    /// The reply sent for a Call whose action has no handler.
    pub fn not_implemented(message_id: impl Into<String>, action: &str) -> Self {
        Message::call_error(
            message_id,
            ErrorCode::NotImplemented,
            format!("Action {} not supported", action),
        )
    }

    pub fn message_id(&self) -> &str {
        match self {
            Message::Call { message_id, .. }
            | Message::CallResult { message_id, .. }
            | Message::CallError { message_id, .. } => message_id,
        }
    }

    pub fn type_id(&self) -> MessageTypeId {
        match self {
            Message::Call { .. } => MessageTypeId::Call,
            Message::CallResult { .. } => MessageTypeId::CallResult,
            Message::CallError { .. } => MessageTypeId::CallError,
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Message::Call { action, .. } => Some(action),
            _ => None,
        }
    }

    /// Payload carried by the envelope; for CallError this is `errorDetails`.
    pub fn payload(&self) -> &Value {
        match self {
            Message::Call { payload, .. } | Message::CallResult { payload, .. } => payload,
            Message::CallError { error_details, .. } => error_details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

fn malformed(reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedEnvelope(reason.into())
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn expect_object(value: Value, what: &str) -> Result<Value, DecodeError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(malformed(format!("{} must be a JSON object", what)))
    }
}

fn expect_string(value: Value, what: &str) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(malformed(format!("{} must be a string", what))),
    }
}

pub fn encode(msg: &Message) -> String {
    let mut frame = vec![
        Value::from(msg.type_id().as_u64()),
        Value::String(msg.message_id().to_string()),
    ];
    match msg {
        Message::Call { action, payload, .. } => {
            frame.push(Value::String(action.clone()));
            frame.push(payload.clone());
        }
        Message::CallResult { payload, .. } => frame.push(payload.clone()),
        Message::CallError { error_code, error_description, error_details, .. } => {
            frame.push(Value::String(error_code.as_str().to_string()));
            frame.push(Value::String(error_description.clone()));
            frame.push(error_details.clone());
        }
    }
    Value::Array(frame).to_string()
}

/// Parses one OCPP-J text frame.
///
/// Two checks go beyond the bare wire format: an empty `messageId` is
/// rejected, since it could never be correlated, and a Call payload, when
/// present, must be a JSON object. A missing Call payload decodes as `{}`,
/// but an explicit `null` is rejected.
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(malformed("top level is not an array")),
    };
    let arity = items.len();
    if arity < 3 {
        return Err(malformed(format!("expected at least 3 elements, got {}", arity)));
    }

    let mut it = items.into_iter();
    // Arity was checked above so the first three elements exist.
    let type_id = it.next().and_then(|v| v.as_u64());
    let message_id = it
        .next()
        .map(|v| expect_string(v, "messageId"))
        .transpose()?
        .unwrap_or_default();
    if message_id.is_empty() {
        return Err(malformed("messageId is empty"));
    }

    match type_id {
        Some(CALL) => {
            if arity > 4 {
                return Err(malformed(format!("Call expects 3 or 4 elements, got {}", arity)));
            }
            let action = it
                .next()
                .map(|v| expect_string(v, "action"))
                .transpose()?
                .unwrap_or_default();
            if action.is_empty() {
                return Err(malformed("action is empty"));
            }
            let payload = match it.next() {
                Some(v) => expect_object(v, "Call payload")?,
                None => empty_object(),
            };
            Ok(Message::Call { message_id, action, payload })
        }
        Some(CALL_RESULT) => {
            if arity != 3 {
                return Err(malformed(format!("CallResult expects 3 elements, got {}", arity)));
            }
            let payload = expect_object(it.next().unwrap_or_default(), "CallResult payload")?;
            Ok(Message::CallResult { message_id, payload })
        }
        Some(CALL_ERROR) => {
            if arity < 4 || arity > 5 {
                return Err(malformed(format!("CallError expects 4 or 5 elements, got {}", arity)));
            }
            let error_code = expect_string(it.next().unwrap_or_default(), "errorCode")?;
            let error_description =
                expect_string(it.next().unwrap_or_default(), "errorDescription")?;
            let error_details = match it.next() {
                Some(v) => expect_object(v, "errorDetails")?,
                None => empty_object(),
            };
            Ok(Message::CallError {
                message_id,
                error_code: ErrorCode::parse(&error_code),
                error_description,
                error_details,
            })
        }
        Some(other) => Err(malformed(format!("unknown messageTypeId {}", other))),
        None => Err(malformed("messageTypeId is not an unsigned integer")),
    }
}
