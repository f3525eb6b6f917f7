//! Framed wire protocol between the client and the controller.
//!
//! Every message is `tag (u8) | payload length (u32 BE) | payload`. Control
//! messages carry JSON, camera frames carry raw RGB8 samples prefixed with
//! their dimensions. The concrete bytes are private to the session; callers
//! only ever see decoded types.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

const TAG_CONTROL: u8 = 1;
const TAG_FRAME: u8 = 2;
const HEADER_LEN: usize = 5;
/// Generous bound, a 640x480 RGB8 frame is under 1 MiB
const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth { key: String },
    SetSpeeds { seq: u32, targets: Vec<f32> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    AuthOk,
    AuthRejected { reason: String },
    Ack { seq: u32 },
}

/// Undecoded camera frame, interleaved RGB8
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    Control(ControlReply),
    Frame(RawFrame),
}

/// Discovery runs over UDP with plain JSON datagrams.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Discover,
    Announce {
        id: String,
        motor_count: u8,
        has_camera: bool,
    },
}

pub struct ControllerCodec;

impl Encoder<ClientMessage> for ControllerCodec {
    type Error = Error;

    fn encode(&mut self, message: ClientMessage, buf: &mut BytesMut) -> Result<(), Error> {
        let payload = serde_json::to_vec(&message)?;
        buf.reserve(HEADER_LEN + payload.len());
        buf.put_u8(TAG_CONTROL);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for ControllerCodec {
    type Item = ControllerMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ControllerMessage>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = buf[0];
        let payload_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "payload length {} exceeds limit",
                payload_len
            )));
        }
        if buf.len() < HEADER_LEN + payload_len {
            buf.reserve(HEADER_LEN + payload_len - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(payload_len);

        match tag {
            TAG_CONTROL => {
                let reply = serde_json::from_slice(&payload)?;
                Ok(Some(ControllerMessage::Control(reply)))
            }
            TAG_FRAME => {
                if payload.len() < 4 {
                    return Err(Error::Protocol("frame payload too short".to_owned()));
                }
                let width = u16::from_be_bytes([payload[0], payload[1]]);
                let height = u16::from_be_bytes([payload[2], payload[3]]);
                let expected = 4 + 3 * width as usize * height as usize;
                if payload.len() != expected {
                    return Err(Error::Protocol(format!(
                        "frame payload is {} bytes, expected {} for {}x{}",
                        payload.len(),
                        expected,
                        width,
                        height
                    )));
                }
                Ok(Some(ControllerMessage::Frame(RawFrame {
                    width,
                    height,
                    pixels: payload[4..].to_vec(),
                })))
            }
            other => Err(Error::Protocol(format!("unknown message tag {}", other))),
        }
    }
}
