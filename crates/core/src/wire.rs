//! Decoding of watch stream messages shaped `{type, object}`.

use serde::Deserialize;

use crate::{KindTag, Resource, WatchEvent};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message lacks type or object")]
    MissingField,
    #[error("unknown watch event type: {0}")]
    UnknownType(String),
    #[error("object has no metadata.name")]
    Unnamed,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    object: Option<serde_json::Value>,
}

/// Decode one text line of a watch stream.
pub fn decode_wire(kind: KindTag, line: &str) -> Result<WatchEvent, WireError> {
    let v: serde_json::Value = serde_json::from_str(line)?;
    decode_wire_value(kind, v)
}

/// Decode an already-parsed watch message.
pub fn decode_wire_value(kind: KindTag, v: serde_json::Value) -> Result<WatchEvent, WireError> {
    let msg: WireEvent = serde_json::from_value(v)?;
    let (Some(ty), Some(object)) = (msg.kind, msg.object) else {
        return Err(WireError::MissingField);
    };
    match ty.as_str() {
        "ADDED" => Ok(WatchEvent::Added(Resource::from_raw(kind, object).ok_or(WireError::Unnamed)?)),
        "MODIFIED" => Ok(WatchEvent::Modified(Resource::from_raw(kind, object).ok_or(WireError::Unnamed)?)),
        "DELETED" => Ok(WatchEvent::Deleted(Resource::from_raw(kind, object).ok_or(WireError::Unnamed)?)),
        "ERROR" => {
            let message = object
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| object.to_string());
            Ok(WatchEvent::Error(message))
        }
        _ => Err(WireError::UnknownType(ty)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_added_modified_deleted() {
        let ev = decode_wire(KindTag::Pod, r#"{"type":"ADDED","object":{"metadata":{"name":"a"}}}"#).unwrap();
        assert!(matches!(ev, WatchEvent::Added(ref r) if r.name == "a"));
        let ev = decode_wire(KindTag::Pod, r#"{"type":"MODIFIED","object":{"metadata":{"name":"a"}}}"#).unwrap();
        assert_eq!(ev.type_str(), "MODIFIED");
        let ev = decode_wire(KindTag::Pod, r#"{"type":"DELETED","object":{"metadata":{"name":"a"}}}"#).unwrap();
        assert_eq!(ev.resource().map(|r| r.name.as_str()), Some("a"));
    }

    #[test]
    fn server_errors_carry_status_message() {
        let ev = decode_wire(KindTag::Pod, r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#).unwrap();
        assert_eq!(ev, WatchEvent::Error("too old resource version".into()));
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(matches!(decode_wire(KindTag::Pod, r#"{"type":"UNKNOWN"}"#), Err(WireError::MissingField)));
        assert!(matches!(decode_wire(KindTag::Pod, r#"{"object":{}}"#), Err(WireError::MissingField)));
        assert!(matches!(
            decode_wire(KindTag::Pod, r#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"7"}}}"#),
            Err(WireError::UnknownType(t)) if t == "BOOKMARK"
        ));
        assert!(matches!(decode_wire(KindTag::Pod, r#"{"type":"ADDED","object":{"metadata":{}}}"#), Err(WireError::Unnamed)));
        assert!(matches!(decode_wire(KindTag::Pod, "not json"), Err(WireError::Json(_))));
    }
}
