use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

// Operations exchanged with the server.
pub const OP_VALIDATE: &str = "validate";
pub const OP_CONNECT_EXTENSION: &str = "connectExtension";
pub const OP_CONFIGURE_EXTENSION: &str = "configureExtension";
pub const OP_RECONNECT_REQUIRED: &str = "reconnectRequired";
pub const OP_PUBLISH: &str = "publish";
pub const OP_QUERY: &str = "query";
pub const OP_NOTIFICATION: &str = "notification";
/// Pseudo-op a test server may send to shut the client down for good.
pub const OP_TEST_CLOSE: &str = "testRequestsClientClose";

// Frame fields.
pub const FIELD_OP: &str = "op";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_BODY: &str = "body";
pub const FIELD_OBJECT: &str = "object";
pub const FIELD_MESSAGE_HEADERS: &str = "messageHeaders";

/// Inbound header carrying the reply address for a query.
pub const REPLY_ADDR_HEADER: &str = "REPLY_ADDR_HEADER";
/// Outbound header echoing the reply address on every response frame.
pub const RESPONSE_ADDRESS_HEADER: &str = "X-Reply-Address";

pub const SOURCES_RESOURCE: &str = "sources";
pub const CREDENTIALS_RESOURCE: &str = "system.credentials";
pub const PARAM_RECONNECT_SECRET: &str = "reconnectSecret";

// Query response status codes.
pub const QUERY_PARTIAL: i64 = 100;
pub const QUERY_COMPLETE: i64 = 200;
pub const QUERY_EMPTY: i64 = 204;
pub const QUERY_ERROR: i64 = 400;

/// A structured error returned to the server in a status-400 response frame.
///
/// `template` uses zero-based `{index}` placeholders which the server
/// substitutes from `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "messageCode")]
    pub code: String,
    #[serde(rename = "messageTemplate")]
    pub template: String,
    pub parameters: Vec<Value>,
}

impl ErrorMessage {
    pub fn new(
        code: impl Into<String>,
        template: impl Into<String>,
        parameters: Vec<Value>,
    ) -> Self {
        ErrorMessage {
            code: code.into(),
            template: template.into(),
            parameters,
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :: {}", self.code, self.template)
    }
}

pub(crate) fn validate_frame(auth_token: &str) -> Value {
    json!({
        "op": OP_VALIDATE,
        "resourceName": CREDENTIALS_RESOURCE,
        "object": auth_token,
    })
}

pub(crate) fn connect_extension_frame(source_name: &str, reconnect_secret: &str) -> Value {
    json!({
        "op": OP_CONNECT_EXTENSION,
        "resourceName": SOURCES_RESOURCE,
        "resourceId": source_name,
        "parameters": { PARAM_RECONNECT_SECRET: reconnect_secret },
    })
}

pub(crate) fn query_response_frame(code: i64, reply_address: &str, body: Option<&Value>) -> Value {
    let mut frame = json!({
        "status": code,
        "headers": { RESPONSE_ADDRESS_HEADER: reply_address },
    });
    if let (Some(body), Some(map)) = (body, frame.as_object_mut()) {
        map.insert(FIELD_BODY.to_string(), body.clone());
    }
    frame
}

pub(crate) fn notification_frame(source_name: &str, body: &Value) -> Value {
    json!({
        "op": OP_NOTIFICATION,
        "resourceName": SOURCES_RESOURCE,
        "resourceId": source_name,
        "object": body,
    })
}
