use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// One request frame, newline-delimited JSON over the local socket.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: Value,
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Server frames. Progress events stream ahead of the terminal result or
/// error frame for the same `call_id`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Progress {
        call_id: u64,
        current: usize,
        total: usize,
        path: String,
        info: String,
    },
    Result {
        call_id: u64,
        result: Value,
    },
    Error {
        call_id: u64,
        error: WireError,
    },
}

impl ServerFrame {
    pub fn call_id(&self) -> u64 {
        match self {
            ServerFrame::Progress { call_id, .. }
            | ServerFrame::Result { call_id, .. }
            | ServerFrame::Error { call_id, .. } => *call_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub error_kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl WireError {
    pub fn from_error(err: &Error) -> Self {
        let detail = match err {
            Error::StoreWriteFailed { failed_ids } => Some(serde_json::json!({
                "failed_ids": failed_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            })),
            _ => None,
        };
        Self { error_kind: err.kind().to_string(), message: err.to_string(), detail }
    }

    pub fn into_error(self) -> Error {
        Error::from_kind(&self.error_kind, &self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let raw = r#"{"method":"query_fts","args":{"text":"auth"},"call_id":7}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "query_fts");
        assert_eq!(req.call_id, 7);
        assert_eq!(req.args["text"], "auth");
        assert!(req.timeout_ms.is_none());

        let encoded = serde_json::to_string(&req).unwrap();
        assert!(!encoded.contains("timeout_ms"));
    }

    #[test]
    fn result_frame_shape() {
        let frame = ServerFrame::Result { call_id: 3, result: json!({"ok": true}) };
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded["frame"], "result");
        assert_eq!(encoded["call_id"], 3);

        let decoded: ServerFrame = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.call_id(), 3);
    }

    #[test]
    fn error_frame_carries_kind_and_detail() {
        let err = Error::StoreWriteFailed { failed_ids: vec![uuid::Uuid::nil()] };
        let wire = WireError::from_error(&err);
        assert_eq!(wire.error_kind, "StoreWriteFailed");
        assert!(wire.detail.is_some());

        let wire = WireError::from_error(&Error::IndexMissing("fts".into()));
        assert_eq!(wire.error_kind, "IndexMissing");
        assert_eq!(wire.into_error().kind(), "IndexMissing");
    }

    #[test]
    fn progress_frame_round_trips() {
        let frame = ServerFrame::Progress {
            call_id: 1,
            current: 5,
            total: 10,
            path: "src/a.py".into(),
            info: "indexed".into(),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        let decoded: ServerFrame = serde_json::from_str(&raw).unwrap();
        match decoded {
            ServerFrame::Progress { current, total, .. } => {
                assert_eq!(current, 5);
                assert_eq!(total, 10);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }
}
