//! Wire protocol types shared by both channel kinds.
//!
//! Messages without a `kind` are requests (`action` present) or terminal
//! responses (`sequenceId` present). Everything else carries a `kind` tag:
//! - `progress`: non-terminal notification for an outstanding request
//! - `reverseCall`: the peer asks this side to compute something
//! - `reverseCall.response`: answer to a reverse call issued by this side

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, SerializedError};

/// Action used for the version handshake.
pub const GET_VERSION: &str = "get_version";

/// Correlates one outbound request with its terminal response.
pub type SequenceId = u64;

/// Correlates one reverse call with its response. Disjoint from [`SequenceId`].
pub type ReverseCallId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(rename = "sequenceId", alias = "sequence")]
    pub sequence: SequenceId,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// Terminal response for a request. Exactly one of `data`/`error` is meaningful;
/// `error` wins if a peer sends both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "sequenceId", alias = "sequence")]
    pub sequence: SequenceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    pub fn success(sequence: SequenceId, data: Value) -> Self {
        Self {
            sequence,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(sequence: SequenceId, error: &SerializedError) -> Self {
        Self {
            sequence,
            data: None,
            error: Some(error.to_value()),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        settle(self.data, self.error)
    }
}

/// Outcome of a `{data|result, error}` pair. An error that is not a
/// well-formed `SerializedError` is kept as its JSON text.
pub(crate) fn settle(data: Option<Value>, error: Option<Value>) -> Result<Value, RpcError> {
    match error {
        Some(error) => Err(RpcError::Remote(
            SerializedError::from_value(&error)
                .unwrap_or_else(|| SerializedError::new("Error", error.to_string())),
        )),
        None => Ok(data.unwrap_or(Value::Null)),
    }
}

/// Messages tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "sequenceId", alias = "sequence")]
        sequence: SequenceId,
        #[serde(default)]
        args: Vec<Value>,
    },

    #[serde(rename = "reverseCall")]
    ReverseCall {
        id: ReverseCallId,
        method: String,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "reverseCall.response")]
    ReverseCallResponse {
        id: ReverseCallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl Event {
    const KINDS: [&'static str; 3] = ["progress", "reverseCall", "reverseCall.response"];

    pub fn reverse_success(id: ReverseCallId, result: Value) -> Self {
        Self::ReverseCallResponse {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn reverse_failure(id: ReverseCallId, error: &SerializedError) -> Self {
        Self::ReverseCallResponse {
            id,
            result: None,
            error: Some(error.to_value()),
        }
    }
}

/// Any message that can cross a channel, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl WireMessage {
    /// Classify a raw JSON message.
    ///
    /// Returns `Ok(None)` for a well-formed message with an unknown `kind`:
    /// newer peers may send kinds this side does not understand yet.
    pub fn decode(value: Value) -> Result<Option<Self>, RpcError> {
        let Value::Object(ref fields) = value else {
            return Err(RpcError::protocol(format!("expected object, got {value}")));
        };

        if let Some(kind) = fields.get("kind") {
            let Some(kind) = kind.as_str().map(str::to_owned) else {
                return Err(RpcError::protocol("`kind` is not a string"));
            };
            if !Event::KINDS.contains(&kind.as_str()) {
                return Ok(None);
            }
            return serde_json::from_value(value)
                .map(|event| Some(Self::Event(event)))
                .map_err(|e| RpcError::protocol(format!("malformed {kind}: {e}")));
        }

        if fields.contains_key("action") {
            return serde_json::from_value(value)
                .map(|request| Some(Self::Request(request)))
                .map_err(|e| RpcError::protocol(format!("malformed request: {e}")));
        }

        if fields.contains_key("sequenceId") || fields.contains_key("sequence") {
            return serde_json::from_value(value)
                .map(|response| Some(Self::Response(response)))
                .map_err(|e| RpcError::protocol(format!("malformed response: {e}")));
        }

        Err(RpcError::protocol("message has no kind, action or sequenceId"))
    }

    pub fn encode(&self) -> Value {
        // Every variant is plain data with string keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<Request> for WireMessage {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for WireMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Event> for WireMessage {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Payload of the `get_version` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> WireMessage {
        WireMessage::decode(value).unwrap().unwrap()
    }

    #[test]
    fn request_serializes() {
        let req = Request {
            action: "parse_text".to_string(),
            params: json!({"text": "ねこ"}),
            sequence: 7,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "action": "parse_text",
          "params": {
            "text": "ねこ"
          },
          "sequenceId": 7
        }
        "#);
    }

    #[test]
    fn envelopes_carry_sequence_id() {
        let request = WireMessage::from(Request {
            action: GET_VERSION.to_string(),
            params: json!({}),
            sequence: 0,
        })
        .encode();
        assert_eq!(
            request,
            json!({"action": "get_version", "params": {}, "sequenceId": 0})
        );
        assert_eq!(
            WireMessage::from(Response::success(0, json!({"version": 1}))).encode(),
            json!({"sequenceId": 0, "data": {"version": 1}})
        );
        assert!(request.get("sequence").is_none());
    }

    #[test]
    fn progress_serializes_with_kind() {
        let event = Event::Progress {
            sequence: 3,
            args: vec![json!({"index": 1, "count": 4})],
        };
        let value = WireMessage::from(event).encode();
        assert_eq!(value["kind"], "progress");
        assert_eq!(value["sequenceId"], 3);
        assert_eq!(value["args"][0]["count"], 4);
    }

    #[test]
    fn reverse_call_response_serializes() {
        let event = Event::reverse_success(3, json!({"width": 16, "height": 9}));
        assert_eq!(
            WireMessage::from(event).encode(),
            json!({
                "kind": "reverseCall.response",
                "id": 3,
                "result": {"width": 16, "height": 9}
            })
        );
    }

    #[test]
    fn decodes_success_response() {
        let msg = decode(json!({"sequenceId": 7, "data": {"version": 1}}));
        let WireMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.sequence, 7);
        assert_eq!(response.into_result().unwrap(), json!({"version": 1}));
    }

    #[test]
    fn decodes_legacy_sequence_key() {
        let msg = decode(json!({"sequence": 2, "data": null}));
        let WireMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.sequence, 2);
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn error_response_becomes_remote_error() {
        let msg = decode(json!({
            "sequenceId": 4,
            "error": {"name": "MecabError", "message": "dictionary missing"}
        }));
        let WireMessage::Response(response) = msg else {
            panic!("expected response");
        };
        match response.into_result() {
            Err(RpcError::Remote(err)) => {
                assert_eq!(err.name, "MecabError");
                assert_eq!(err.message, "dictionary missing");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_request_without_params() {
        let msg = decode(json!({"action": "get_version", "sequenceId": 0}));
        assert_eq!(
            msg,
            WireMessage::Request(Request {
                action: GET_VERSION.to_string(),
                params: json!({}),
                sequence: 0,
            })
        );
    }

    #[test]
    fn decodes_reverse_call() {
        let msg = decode(json!({
            "id": 3,
            "kind": "reverseCall",
            "method": "getImageDetails",
            "payload": {"mediaType": "image/png"}
        }));
        assert_eq!(
            msg,
            WireMessage::Event(Event::ReverseCall {
                id: 3,
                method: "getImageDetails".to_string(),
                payload: json!({"mediaType": "image/png"}),
            })
        );
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let decoded = WireMessage::decode(json!({"kind": "heartbeat", "sequenceId": 1})).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn shapeless_messages_are_protocol_errors() {
        assert!(matches!(
            WireMessage::decode(json!({"hello": "world"})),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            WireMessage::decode(json!([1, 2, 3])),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(
            WireMessage::decode(json!({"kind": "progress", "args": []})),
            Err(RpcError::Protocol(_))
        ));
    }
}
