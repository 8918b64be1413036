use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request per bridge process: `{"op": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub op: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeErrorBody>,
}

impl BridgeResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(BridgeErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        Self::err(error.protocol_code(), error.message())
    }

    /// Single line, so readers can take the last line of stdout.
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"INTERNAL","message":"failed to serialize response"}}"#.to_string()
        })
    }

    /// Turns a reply into the caller's result. `ok:false` maps back onto the error taxonomy.
    pub fn into_result(self) -> Result<Value, AppError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let (code, message) = match self.error {
            Some(body) => (body.code, body.message),
            None => ("INTERNAL".to_string(), "bridge reported failure without details".to_string()),
        };
        Err(match code.as_str() {
            "VALIDATION" => AppError::Validation(message),
            "CONFLICT" => AppError::Conflict(message),
            _ => AppError::Internal(message),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateNotePayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateNotePayload {
    pub id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub updated_at: Option<i64>,
    pub expected_updated_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteNotePayload {
    pub id: String,
    pub expected_updated_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchNotesPayload {
    pub query: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetNotePayload {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::{BridgeRequest, BridgeResponse};
    use crate::errors::AppError;
    use serde_json::json;

    #[test]
    fn payload_defaults_to_null() {
        let request: BridgeRequest = serde_json::from_str(r#"{"op":"ensure_inbox"}"#).expect("request");
        assert_eq!(request.op, "ensure_inbox");
        assert!(request.payload.is_null());
    }

    #[test]
    fn failure_reply_maps_back_to_typed_error() {
        let line = BridgeResponse::err("CONFLICT", "stale note update rejected").to_line();
        assert!(!line.contains('\n'));
        assert!(!line.contains("\"data\""));
        let parsed: BridgeResponse = serde_json::from_str(&line).expect("parse");
        assert!(matches!(parsed.into_result(), Err(AppError::Conflict(message)) if message == "stale note update rejected"));

        let ok = BridgeResponse::ok(json!({"folder_id": "abc"}));
        assert_eq!(ok.into_result().expect("ok")["folder_id"], "abc");
    }
}
