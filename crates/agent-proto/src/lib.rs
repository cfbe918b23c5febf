// agent-proto: CM control-protocol command types and serialization.
//
// Every WebSocket frame is a JSON object with a `cmd` discriminator plus the
// envelope fields `msgid` / `refid` / `cam_id`.  The command registry is the
// `CommandBody` enum; adding a command means adding a variant.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod commands;
pub mod objects;
pub mod time;
pub mod token;

pub use commands::*;
pub use objects::*;
pub use token::AccessToken;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One control-plane frame.
///
/// `msgid` is assigned by the sending side and increases monotonically per
/// session.  A reply carries the originator's `msgid` in `refid`; `cam_id`
/// is inherited from the command being replied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub msgid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cam_id: Option<u64>,
    #[serde(flatten)]
    pub body: CommandBody,
}

impl Command {
    pub fn new(msgid: u64, body: CommandBody) -> Self {
        Command {
            msgid,
            refid: None,
            cam_id: None,
            body,
        }
    }

    /// Build a reply to `orig`: `refid` set to the original `msgid`,
    /// `cam_id` inherited.
    pub fn reply(orig: &Command, msgid: u64, body: CommandBody) -> Self {
        Command {
            msgid,
            refid: Some(orig.msgid),
            cam_id: orig.cam_id,
            body,
        }
    }

    /// The universal acknowledgment for `orig`.
    pub fn done(orig: &Command, msgid: u64, status: DoneStatus) -> Self {
        Command::reply(
            orig,
            msgid,
            CommandBody::Done(Done {
                orig_cmd: orig.body.name().to_owned(),
                status,
            }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse one inbound frame.
///
/// Malformed JSON and unknown `cmd` values are logged and yield `None`; the
/// session is never dropped over a single bad frame.
pub fn parse(text: &str) -> Option<Command> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed control frame");
            return None;
        }
    };

    let cmd = value.get("cmd").and_then(|c| c.as_str()).map(str::to_owned);
    match serde_json::from_value::<Command>(value) {
        Ok(command) => Some(command),
        Err(e) => {
            match cmd {
                Some(name) => warn!(cmd = %name, error = %e, "unknown or invalid command"),
                None => warn!(error = %e, "control frame without cmd field"),
            }
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Message-ID generator
// ---------------------------------------------------------------------------

/// Monotonic per-session `msgid` source, shareable across tasks.
#[derive(Debug, Default)]
pub struct MsgIdGen(std::sync::atomic::AtomicU64);

impl MsgIdGen {
    pub fn new() -> Self {
        MsgIdGen(std::sync::atomic::AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Done status
// ---------------------------------------------------------------------------

/// Status field of the `done` acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoneStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "CM_ERROR")]
    CmError,
    #[serde(rename = "MISSED_PARAM")]
    MissedParam,
    #[serde(rename = "NOT_SUPPORTED")]
    NotSupported,
    #[serde(rename = "SYSTEM_ERROR")]
    SystemError,
    #[serde(rename = "INVALID_PARAM")]
    InvalidParam,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_inherits_cam_id_and_sets_refid() {
        let mut orig = Command::new(7, CommandBody::GetCamStatus);
        orig.cam_id = Some(42);

        let reply = Command::done(&orig, 8, DoneStatus::Ok);

        assert_eq!(reply.msgid, 8);
        assert_eq!(reply.refid, Some(7));
        assert_eq!(reply.cam_id, Some(42));
        match reply.body {
            CommandBody::Done(d) => {
                assert_eq!(d.orig_cmd, "get_cam_status");
                assert_eq!(d.status, DoneStatus::Ok);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_unknown_cmd() {
        assert!(parse(r#"{"cmd":"warp_drive_engage","msgid":1}"#).is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("{not json").is_none());
        assert!(parse(r#"{"msgid":1}"#).is_none());
    }

    #[test]
    fn msgid_gen_is_monotonic() {
        let r#gen = MsgIdGen::new();
        let a = r#gen.next();
        let b = r#gen.next();
        assert!(b > a);
    }
}
