use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_MSG_START: &str = "msg_start";
pub const EVENT_PARA_START: &str = "para_start";
pub const EVENT_PARA_CHUNK: &str = "para_chunk";
pub const EVENT_PARA_END: &str = "para_end";
pub const EVENT_MSG_END: &str = "msg_end";
pub const EVENT_ACK: &str = "ack";
pub const EVENT_SEND_FAIL: &str = "send_fail";

pub const MAX_CHUNK_SIZE: usize = 4 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const MAX_PARAGRAPHS: i64 = 512;
pub const MAX_ACTIVE_MESSAGES: usize = 100;

/// Wire envelope carried on the stream in both directions.
/// `v` stays an untyped map: the server only ever reads the handful of
/// fields it validates and forwards the raw frame bytes untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub t: String,
    #[serde(default)]
    pub v: Value,
    #[serde(default)]
    pub ts: i64,
}

impl Envelope {
    pub fn new(event_type: &str, value: impl Serialize) -> Self {
        Self {
            t: event_type.to_string(),
            v: serde_json::to_value(value).unwrap_or(Value::Null),
            ts: Utc::now().timestamp_millis(),
        }
    }

    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn marshal(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.v.get("msgId").and_then(Value::as_str)
    }

    pub fn para_index(&self) -> i64 {
        self.v.get("i").and_then(Value::as_i64).unwrap_or(-1)
    }

    pub fn chunk_text(&self) -> &str {
        self.v.get("s").and_then(Value::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceValue {
    pub online: usize,
    pub required: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFailValue {
    #[serde(rename = "msgId")]
    pub msg_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_envelope_fields() {
        let raw = r#"{"t":"para_chunk","v":{"msgId":"m1","i":3,"s":"hello"},"ts":1712000000000}"#;
        let env = Envelope::parse(raw).unwrap();
        assert_eq!(env.t, EVENT_PARA_CHUNK);
        assert_eq!(env.msg_id(), Some("m1"));
        assert_eq!(env.para_index(), 3);
        assert_eq!(env.chunk_text(), "hello");
    }

    #[test]
    fn missing_fields_fall_back() {
        let env = Envelope::parse(r#"{"t":"msg_start","v":{}}"#).unwrap();
        assert_eq!(env.msg_id(), None);
        assert_eq!(env.para_index(), -1);
        assert_eq!(env.chunk_text(), "");
    }

    #[test]
    fn send_fail_round_trip() {
        let env = Envelope::new(
            EVENT_SEND_FAIL,
            SendFailValue {
                msg_id: "m9".to_string(),
                reason: "peer_offline".to_string(),
            },
        );
        let parsed: Value = serde_json::from_str(&env.marshal().unwrap()).unwrap();
        assert_eq!(parsed["t"], json!("send_fail"));
        assert_eq!(parsed["v"]["msgId"], json!("m9"));
        assert_eq!(parsed["v"]["reason"], json!("peer_offline"));
        assert!(parsed["ts"].as_i64().unwrap() > 0);
    }
}
