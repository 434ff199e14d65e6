// Client protocol frames
//
// Every WebSocket text frame is one JSON object. Client -> server frames are
// requests `{type, id, ...params}`; server -> client frames are either the
// paired response (`response.ok` / `response.error`) or an event whose tag is
// its topic.

use serde::Deserialize;
use serde_json::{json, Value};

use aether_core::KernelError;

/// A parsed client request
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    /// Dotted verb, e.g. `process.spawn`
    #[serde(rename = "type")]
    pub kind: String,
    /// Client-chosen correlation id
    pub id: String,
    /// Everything else
    #[serde(flatten)]
    pub params: Value,
}

impl RequestFrame {
    /// Parse a text frame
    pub fn parse(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| format!("malformed frame: {e}"))
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn i64_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(Value::as_i64)
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// Successful response frame
pub fn ok_frame(id: &str, data: Value) -> Value {
    json!({"type": "response.ok", "id": id, "data": data})
}

/// Error response frame with a protocol error code
pub fn error_frame(id: &str, code: &str, message: impl AsRef<str>) -> Value {
    json!({
        "type": "response.error",
        "id": id,
        "error": message.as_ref(),
        "code": code,
    })
}

/// Map a kernel error onto its response frame
pub fn error_frame_from(id: &str, error: &KernelError) -> Value {
    error_frame(id, error.code(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_parses_type_id_and_params() {
        let frame =
            RequestFrame::parse(r#"{"type": "process.spawn", "id": "r1", "role": "Greeter", "max_steps": 5}"#)
                .unwrap();
        assert_eq!(frame.kind, "process.spawn");
        assert_eq!(frame.id, "r1");
        assert_eq!(frame.str_param("role"), Some("Greeter"));
        assert_eq!(frame.u64_param("max_steps"), Some(5));
        assert_eq!(frame.str_param("missing"), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(RequestFrame::parse("not json").is_err());
        assert!(RequestFrame::parse(r#"{"id": "r1"}"#).is_err());
        assert!(RequestFrame::parse(r#"{"type": "x"}"#).is_err());
    }

    #[test]
    fn response_frames_have_the_contracted_shape() {
        let ok = ok_frame("r1", json!({"pid": 3}));
        assert_eq!(ok["type"], "response.ok");
        assert_eq!(ok["id"], "r1");
        assert_eq!(ok["data"]["pid"], 3);

        let err = error_frame("r2", "not_found", "no such process");
        assert_eq!(err["type"], "response.error");
        assert_eq!(err["code"], "not_found");
    }

    #[test]
    fn kernel_errors_map_to_wire_codes() {
        let err = error_frame_from("r1", &KernelError::NoSuchProcess(9));
        assert_eq!(err["code"], "not_found");
        let err = error_frame_from("r1", &KernelError::quota("cap"));
        assert_eq!(err["code"], "quota_exceeded");
    }
}
