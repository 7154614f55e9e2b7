//! Wire-format envelopes for the JSON-RPC protocol.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version stamped on every frame.
pub const PROTOCOL_VERSION: &str = "2.0";

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

/// Client-chosen correlation id.
///
/// Clients may send a string, a number, `null`, or omit the field entirely.
/// The id is carried verbatim through the pending-call table and echoed back
/// on the response; it is never coerced to a concrete type. Ids of any other
/// JSON shape are treated as absent and answered with protocol null.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum CallId {
    /// The request carried no id field, or an id of unsupported shape.
    #[default]
    Absent,
    /// An explicit JSON `null` id.
    Null,
    /// A string id.
    Str(String),
    /// A numeric id.
    Num(serde_json::Number),
}

impl CallId {
    /// Classify a raw JSON value (or a missing field) into a `CallId`.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None => Self::Absent,
            Some(Value::Null) => Self::Null,
            Some(Value::String(s)) => Self::Str(s.clone()),
            Some(Value::Number(n)) => Self::Num(n.clone()),
            Some(_) => Self::Absent,
        }
    }

    /// Whether the id was missing from the request.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The value echoed back on the wire. Absent ids degrade to null so even
    /// an invalid request receives a correlatable response.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Absent | Self::Null => Value::Null,
            Self::Str(s) => Value::String(s.clone()),
            Self::Num(n) => Value::Number(n.clone()),
        }
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(Some(&value)))
    }
}

/// Incoming call envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    /// Call target as `Service.Method`.
    pub method: String,
    /// Raw call parameters, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Client correlation id.
    #[serde(default, skip_serializing_if = "CallId::is_absent")]
    pub id: CallId,
}

/// Outgoing response envelope. Exactly one of `result`/`error` is present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    /// Echoed correlation id; null when the request had none.
    pub id: CallId,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Build a success response.
    pub fn result(id: CallId, result: Value) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: CallId, error: ErrorBody) -> Self {
        Self {
            jsonrpc: protocol_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Structured error body inside a [`Response`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `METHOD_NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Unsolicited server-to-client push. Carries no id and is never answered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// Protocol version.
    #[serde(default = "protocol_version")]
    pub jsonrpc: String,
    /// Notification name.
    pub method: String,
    /// Legacy duplicate of `method`; some clients key on this field.
    pub notification: String,
    /// Push payload: a single value or a positional array.
    pub params: Value,
}

impl Notification {
    /// Single-value params shape.
    pub fn single(method: impl Into<String>, payload: Value) -> Self {
        let method = method.into();
        Self {
            jsonrpc: protocol_version(),
            notification: method.clone(),
            method,
            params: payload,
        }
    }

    /// Array params shape.
    pub fn array(method: impl Into<String>, items: Vec<Value>) -> Self {
        Self::single(method, Value::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── CallId ──────────────────────────────────────────────────────

    #[test]
    fn call_id_from_string() {
        let id = CallId::from_value(Some(&json!("x1")));
        assert_eq!(id, CallId::Str("x1".into()));
        assert_eq!(id.to_wire(), json!("x1"));
    }

    #[test]
    fn call_id_from_number() {
        let id = CallId::from_value(Some(&json!(7)));
        assert_eq!(id.to_wire(), json!(7));
    }

    #[test]
    fn call_id_from_null() {
        let id = CallId::from_value(Some(&Value::Null));
        assert_eq!(id, CallId::Null);
        assert_eq!(id.to_wire(), Value::Null);
    }

    #[test]
    fn call_id_missing_is_absent() {
        let id = CallId::from_value(None);
        assert!(id.is_absent());
        assert_eq!(id.to_wire(), Value::Null);
    }

    #[test]
    fn call_id_unsupported_shape_is_absent() {
        assert!(CallId::from_value(Some(&json!({"nested": 1}))).is_absent());
        assert!(CallId::from_value(Some(&json!([1, 2]))).is_absent());
    }

    #[test]
    fn call_id_float_preserved() {
        let id = CallId::from_value(Some(&json!(1.5)));
        assert_eq!(id.to_wire(), json!(1.5));
    }

    // ── Request ─────────────────────────────────────────────────────

    #[test]
    fn request_parses_all_id_shapes() {
        let string_id: Request =
            serde_json::from_str(r#"{"method":"Svc.M","id":"abc"}"#).unwrap();
        assert_eq!(string_id.id, CallId::Str("abc".into()));

        let num_id: Request = serde_json::from_str(r#"{"method":"Svc.M","id":42}"#).unwrap();
        assert_eq!(num_id.id.to_wire(), json!(42));

        let null_id: Request = serde_json::from_str(r#"{"method":"Svc.M","id":null}"#).unwrap();
        assert_eq!(null_id.id, CallId::Null);

        let no_id: Request = serde_json::from_str(r#"{"method":"Svc.M"}"#).unwrap();
        assert!(no_id.id.is_absent());
    }

    #[test]
    fn request_defaults_version() {
        let req: Request = serde_json::from_str(r#"{"method":"Svc.M"}"#).unwrap();
        assert_eq!(req.jsonrpc, PROTOCOL_VERSION);
        assert!(req.params.is_none());
    }

    #[test]
    fn request_roundtrip_with_params() {
        let raw = r#"{"jsonrpc":"2.0","method":"Math.Add","params":{"a":2,"b":3},"id":"x1"}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "Math.Add");
        assert_eq!(req.params.unwrap()["a"], 2);

        let req2 = Request {
            jsonrpc: PROTOCOL_VERSION.into(),
            method: "Math.Add".into(),
            params: Some(json!({"a": 2, "b": 3})),
            id: CallId::Str("x1".into()),
        };
        let v: Value = serde_json::to_value(&req2).unwrap();
        assert_eq!(v["id"], "x1");
        assert_eq!(v["params"]["b"], 3);
    }

    #[test]
    fn request_absent_id_not_serialized() {
        let req = Request {
            jsonrpc: PROTOCOL_VERSION.into(),
            method: "Svc.M".into(),
            params: None,
            id: CallId::Absent,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
    }

    // ── Response ────────────────────────────────────────────────────

    #[test]
    fn response_result_shape() {
        let resp = Response::result(CallId::Str("x1".into()), json!(5));
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], "x1");
        assert_eq!(v["result"], 5);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn response_failure_shape() {
        let resp = Response::failure(
            CallId::Num(7.into()),
            ErrorBody {
                code: "METHOD_NOT_FOUND".into(),
                message: "can't find service 'Foo.Bar'".into(),
                details: None,
            },
        );
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["id"], 7);
        assert!(v.get("result").is_none());
        assert_eq!(v["error"]["code"], "METHOD_NOT_FOUND");
        assert!(v["error"]["message"].as_str().unwrap().contains("find service"));
    }

    #[test]
    fn response_absent_id_serializes_as_null() {
        let resp = Response::result(CallId::Absent, json!(true));
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert!(v.get("id").is_some());
        assert_eq!(v["id"], Value::Null);
    }

    #[test]
    fn response_wire_fixture() {
        let raw = r#"{"jsonrpc":"2.0","id":"req_1","result":{"ok":true}}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, CallId::Str("req_1".into()));
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert!(resp.error.is_none());
    }

    // ── ErrorBody ───────────────────────────────────────────────────

    #[test]
    fn error_body_roundtrip() {
        let body = ErrorBody {
            code: "INTERNAL_ERROR".into(),
            message: "boom".into(),
            details: Some(json!({"trace": "abc"})),
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, "INTERNAL_ERROR");
        assert_eq!(back.details.unwrap()["trace"], "abc");
    }

    #[test]
    fn error_body_without_details() {
        let body = ErrorBody {
            code: "NOT_FOUND".into(),
            message: "gone".into(),
            details: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("details"));
    }

    // ── Notification ────────────────────────────────────────────────

    #[test]
    fn notification_single_shape() {
        let n = Notification::single("tick", json!({"price": 100}));
        let v: Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "tick");
        assert_eq!(v["notification"], "tick");
        assert_eq!(v["params"]["price"], 100);
        assert!(v.get("id").is_none());
    }

    #[test]
    fn notification_array_shape() {
        let n = Notification::array("batch", vec![json!(1), json!(2)]);
        let v: Value = serde_json::to_value(&n).unwrap();
        assert_eq!(v["params"], json!([1, 2]));
        assert!(v.get("id").is_none());
    }

    #[test]
    fn notification_wire_fixture() {
        let raw =
            r#"{"jsonrpc":"2.0","method":"tick","notification":"tick","params":{"price":100}}"#;
        let n: Notification = serde_json::from_str(raw).unwrap();
        assert_eq!(n.method, "tick");
        assert_eq!(n.notification, "tick");
        assert_eq!(n.params["price"], 100);
    }
}
