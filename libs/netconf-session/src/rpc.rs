//! `<rpc>` requests and `<rpc-reply>` parsing
use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::TransportError;

pub const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";
pub const BASE_CAPABILITY: &str = "urn:ietf:params:netconf:base:1.0";

lazy_static! {
    static ref REPLY: Regex = Regex::new(
        r#"(?s)<(?:[\w-]+:)?rpc-reply\b([^>]*?)(?:/>|>(.*)</(?:[\w-]+:)?rpc-reply\s*>)"#
    )
    .expect("valid rpc-reply regex");
    static ref MESSAGE_ID: Regex =
        Regex::new(r#"\bmessage-id\s*=\s*["']([^"']*)["']"#).expect("valid message-id regex");
    static ref RPC_ERROR: Regex =
        Regex::new(r"<(?:[\w-]+:)?rpc-error\b").expect("valid rpc-error regex");
    static ref ERROR_MESSAGE: Regex =
        Regex::new(r"(?s)<(?:[\w-]+:)?error-message\b[^>]*>(.*?)</(?:[\w-]+:)?error-message\s*>")
            .expect("valid error-message regex");
    static ref ERROR_TAG: Regex =
        Regex::new(r"(?s)<(?:[\w-]+:)?error-tag\b[^>]*>(.*?)</(?:[\w-]+:)?error-tag\s*>")
            .expect("valid error-tag regex");
    static ref SESSION_ID: Regex =
        Regex::new(r"<(?:[\w-]+:)?session-id\s*>\s*(\d+)\s*</").expect("valid session-id regex");
}

/// The operation body of one `<rpc>`. The session owning the call supplies the envelope
/// and the message-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    body: String,
}

impl Rpc {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// wrap the body in an `<rpc>` envelope
    pub fn to_xml(&self, message_id: &str) -> String {
        format!(
            r#"<rpc message-id="{message_id}" xmlns="{BASE_NS}">{}</rpc>"#,
            self.body
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub message_id: String,
    /// contents of the `<rpc-reply>` element
    pub data: String,
}

impl RpcReply {
    /// Parse an `<rpc-reply>` frame. A reply carrying `<rpc-error>` is returned as
    /// [`TransportError::Rpc`].
    pub fn parse(frame: &str) -> Result<Self, TransportError> {
        let caps = REPLY
            .captures(frame)
            .ok_or_else(|| TransportError::Malformed(format!("expected rpc-reply, got: {frame}")))?;
        let attrs = caps.get(1).map_or("", |m| m.as_str());
        let data = caps.get(2).map_or("", |m| m.as_str()).trim();

        if RPC_ERROR.is_match(data) {
            return Err(TransportError::Rpc(error_message(data)));
        }

        let message_id = MESSAGE_ID
            .captures(attrs)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();

        Ok(Self {
            message_id,
            data: data.to_owned(),
        })
    }
}

fn error_message(data: &str) -> String {
    let capture = |re: &Regex| {
        re.captures(data)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_owned())
    };
    capture(&ERROR_MESSAGE)
        .or_else(|| capture(&ERROR_TAG))
        .unwrap_or_else(|| data.to_owned())
}

/// client `<hello>` advertising base:1.0 only
pub fn client_hello() -> String {
    format!(
        r#"<hello xmlns="{BASE_NS}"><capabilities><capability>{BASE_CAPABILITY}</capability></capabilities></hello>"#
    )
}

/// remote-assigned session-id from a server `<hello>`
pub fn parse_session_id(hello: &str) -> Option<u64> {
    SESSION_ID
        .captures(hello)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
