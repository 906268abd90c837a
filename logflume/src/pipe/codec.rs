//! Frame-body encoding for the message pipe.
//!
//! Frames are length-prefixed by [`LengthDelimitedCodec`] at the transport
//! layer; this module owns the body encoding inside a frame. A body is a JSON
//! object `{"type": <int>, "unit_id": <int>, "payload": ...}` where the
//! payload shape is driven entirely by the integer type tag, so decoding
//! never has to guess.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PipeError;
use crate::message::{Body, BufferOptions, Event, Message, PluginInfo};

/// Raw frame body as it appears on the wire.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: u8,
    unit_id: i32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

/// Serialize a message into a frame body.
pub fn encode(msg: &Message) -> Result<Vec<u8>, PipeError> {
    let payload = match &msg.body {
        Body::InfoRequest | Body::Start | Body::Stop | Body::Terminated => Value::Null,
        Body::InfoResponse(info) => serde_json::to_value(info)?,
        Body::Configure(blob) => Value::String(blob.clone()),
        Body::BufferOption(opts) => serde_json::to_value(opts)?,
        Body::Event(event) | Body::EventChain(event) => serde_json::to_value(event)?,
        Body::Stdout(bytes) => serde_json::to_value(bytes)?,
    };
    let frame = WireFrame {
        kind: msg.body.kind(),
        unit_id: msg.unit_id,
        payload,
    };
    Ok(serde_json::to_vec(&frame)?)
}

/// Deserialize a frame body back into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, PipeError> {
    let frame: WireFrame = serde_json::from_slice(bytes)?;
    let body = match frame.kind {
        0 => Body::InfoRequest,
        1 => Body::InfoResponse(serde_json::from_value::<PluginInfo>(frame.payload)?),
        2 => match frame.payload {
            Value::String(blob) => Body::Configure(blob),
            other => {
                return Err(PipeError::Malformed(format!(
                    "Configure payload must be a string, got {other}"
                )))
            }
        },
        3 => Body::BufferOption(serde_json::from_value::<BufferOptions>(frame.payload)?),
        4 => Body::Start,
        5 => Body::Event(serde_json::from_value::<Event>(frame.payload)?),
        6 => Body::EventChain(serde_json::from_value::<Event>(frame.payload)?),
        7 => Body::Stop,
        8 => Body::Terminated,
        9 => Body::Stdout(serde_json::from_value::<Vec<u8>>(frame.payload)?),
        other => return Err(PipeError::Malformed(format!("unknown message type {other}"))),
    };
    Ok(Message {
        unit_id: frame.unit_id,
        body,
    })
}
