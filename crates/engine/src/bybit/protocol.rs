use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::Result;

/// Topics per subscribe/unsubscribe frame accepted by the public stream.
pub const CONTROL_BATCH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Subscribe,
    Unsubscribe,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Subscribe => "subscribe",
            Op::Unsubscribe => "unsubscribe",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct ControlFrame<'a> {
    req_id: &'a str,
    op: &'a str,
    args: &'a [String],
}

pub fn control_frame(req_id: &str, op: Op, topics: &[String]) -> Result<String> {
    Ok(serde_json::to_string(&ControlFrame {
        req_id,
        op: op.as_str(),
        args: topics,
    })?)
}

pub fn ping_frame() -> &'static str {
    r#"{"op":"ping"}"#
}

/// Acknowledgement of a control or ping frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub req_id: String,
}

/// One decoded inbound text frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Ack(Ack),
    Data { topic: String, data: Value },
    /// Well-formed JSON that is neither an ack nor topic data.
    Other,
}

/// Classify an inbound text frame. Errors only on invalid JSON or a
/// malformed acknowledgement.
pub fn decode(text: &str) -> Result<Inbound> {
    let mut value: Value = serde_json::from_str(text)?;

    if value.get("success").map_or(false, Value::is_boolean) {
        return Ok(Inbound::Ack(serde_json::from_value(value)?));
    }

    let topic = value.get("topic").and_then(Value::as_str).map(str::to_owned);
    match (topic, value.get_mut("data")) {
        (Some(topic), Some(data)) => Ok(Inbound::Data {
            topic,
            data: data.take(),
        }),
        _ => Ok(Inbound::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_shape() {
        let topics = vec!["kline.60.BTCUSDT".to_string(), "kline.60.ETHUSDT".to_string()];
        let text = control_frame("7", Op::Subscribe, &topics).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["req_id"], "7");
        assert_eq!(v["args"][1], "kline.60.ETHUSDT");
    }

    #[test]
    fn decodes_ack_and_rejection() {
        let ok = decode(r#"{"success":true,"ret_msg":"","conn_id":"c1","req_id":"3","op":"subscribe"}"#)
            .unwrap();
        assert!(matches!(ok, Inbound::Ack(Ack { success: true, .. })));

        let rejected = decode(
            r#"{"success":false,"ret_msg":"error:handler not found,topic:kline.60.NOPE","req_id":"4","op":"subscribe"}"#,
        )
        .unwrap();
        match rejected {
            Inbound::Ack(ack) => {
                assert!(!ack.success);
                assert_eq!(ack.req_id, "4");
                assert!(ack.ret_msg.contains("handler not found"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn decodes_pong_without_req_id() {
        let pong = decode(r#"{"success":true,"ret_msg":"pong","conn_id":"c1","op":"ping"}"#).unwrap();
        match pong {
            Inbound::Ack(ack) => assert!(ack.req_id.is_empty()),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn decodes_topic_data() {
        let frame = decode(r#"{"topic":"kline.60.BTCUSDT","data":[{"start":1}],"ts":1,"type":"snapshot"}"#)
            .unwrap();
        match frame {
            Inbound::Data { topic, data } => {
                assert_eq!(topic, "kline.60.BTCUSDT");
                assert!(data.is_array());
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(decode("{not json").is_err());
        assert!(matches!(decode(r#"{"hello":"world"}"#).unwrap(), Inbound::Other));
    }
}
