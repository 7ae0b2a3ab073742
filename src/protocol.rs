//! Privileged-broker wire protocol types.
//!
//! The broker speaks newline-delimited JSON over its Unix socket. Each
//! request carries a numeric `id` echoed in the matching reply; the broker
//! also pushes unsolicited event objects (distinguished by an `"event"`
//! key) for connection establishment and asynchronous grant results.
//!
//! ```text
//! → {"id":1,"op":"permission.grant","permission":"virt.manage"}
//! ← {"id":1,"ok":true}
//! ← {"event":"grant-result","permission":"virt.manage","granted":true}
//! ```

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: RequestOp,
}

/// Operations understood by the broker. Older broker builds reject ops they
/// don't know with an `unknown-op` error, which callers use to walk their
/// fallback chains.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op")]
pub enum RequestOp {
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping,

    /// Query whether a permission is currently granted to this process.
    #[serde(rename = "permission.check")]
    PermissionCheck { permission: String },

    /// Ask the broker to prompt for a permission. The outcome arrives as a
    /// `grant-result` event, not in the reply.
    #[serde(rename = "permission.request")]
    PermissionRequest { permission: String },

    /// Grant a permission directly (modern protocol).
    #[serde(rename = "permission.grant")]
    PermissionGrant { permission: String },

    /// Grant a permission through the legacy package-manager path.
    #[serde(rename = "pm.grant")]
    PmGrant { permission: String },

    /// Spawn a command with the broker's privileges.
    #[serde(rename = "process.spawn")]
    ProcessSpawn { argv: Vec<String> },

    /// Older spelling of the spawn op, kept by some broker builds.
    #[serde(rename = "process.spawn2")]
    ProcessSpawn2 { argv: Vec<String> },
}

// ---------------------------------------------------------------------------
// Replies and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<ReplyError>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyError {
    /// Machine-readable kind: `unknown-op`, `denied`, `internal`, …
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// Error kind a broker uses for ops it does not implement.
pub const ERROR_UNKNOWN_OP: &str = "unknown-op";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// Sent by the broker once per accepted connection.
    Connected { api_version: u32 },

    /// Outcome of an earlier `permission.request`.
    GrantResult {
        permission: String,
        granted: bool,
        #[serde(default)]
        detail: Option<String>,
    },
}

/// One parsed line off the broker socket.
#[derive(Debug)]
pub enum Incoming {
    Reply(Reply),
    Event(Event),
}

/// Classify a raw line as a reply or an event.
///
/// Unknown event kinds and junk lines return `None` — the broker may be
/// newer than this client and extra traffic must not kill the connection.
pub fn parse_incoming(line: &str) -> Option<Incoming> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("event").is_some() {
        serde_json::from_value(value).ok().map(Incoming::Event)
    } else if value.get("id").is_some() {
        serde_json::from_value(value).ok().map(Incoming::Reply)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialises_with_op_tag() {
        let request = Request {
            id: 7,
            op: RequestOp::PermissionGrant {
                permission: "virt.manage".into(),
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"op\":\"permission.grant\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"permission\":\"virt.manage\""));
    }

    #[test]
    fn incoming_classifies_replies_and_events() {
        let reply = parse_incoming(r#"{"id":3,"ok":true}"#).unwrap();
        assert!(matches!(reply, Incoming::Reply(r) if r.id == 3 && r.ok));

        let event =
            parse_incoming(r#"{"event":"grant-result","permission":"virt.manage","granted":false}"#)
                .unwrap();
        match event {
            Incoming::Event(Event::GrantResult { granted, .. }) => assert!(!granted),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn junk_lines_are_dropped() {
        assert!(parse_incoming("not json").is_none());
        assert!(parse_incoming(r#"{"event":"future-thing"}"#).is_none());
    }
}
