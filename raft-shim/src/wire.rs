//! Length-prefixed JSON framing and the frame vocabulary shared with the
//! dispatcher.
//!
//! Every frame on the node's single TCP stream is a 4-byte unsigned
//! big-endian length followed by that many bytes of UTF-8 JSON. The node
//! sends exactly two frame shapes — the [`Register`] handshake and the
//! [`EffectBatch`] replied after each event — and receives [`Event`] frames
//! plus the one-shot [`RegisterReply`].

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Registration request, the first frame a node sends after connecting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Register {
    pub msgtype: String,
    pub name: String,
}

impl Register {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            msgtype: "register".to_string(),
            name: name.into(),
        }
    }
}

/// The dispatcher's answer to a [`Register`] frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterReply {
    pub ok: bool,
}

/// Events the dispatcher delivers to a registered node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum Event {
    Start,
    Msg {
        from: String,
        #[serde(rename = "type")]
        kind: String,
        body: Value,
    },
    Timeout {
        #[serde(rename = "type")]
        kind: String,
        body: Value,
    },
    Quit,
}

impl Event {
    /// Decodes a raw frame into an event.
    ///
    /// Frames carrying an unrecognized `msgtype` decode to `None` so newer
    /// dispatchers remain compatible; a frame with no `msgtype` at all, or a
    /// known event missing required fields, is a transport fault.
    pub fn from_value(value: Value) -> io::Result<Option<Self>> {
        match value.get("msgtype").and_then(Value::as_str) {
            Some("start" | "msg" | "timeout" | "quit") => {
                serde_json::from_value(value).map(Some).map_err(to_io_error)
            }
            Some(_) => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame missing msgtype",
            )),
        }
    }
}

/// One outgoing protocol message declared by a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
}

/// A timer set or clear request. `to` names the node owning the timer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerRequest {
    pub to: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Value,
}

/// The batch of effects transmitted to the dispatcher after each event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EffectBatch {
    #[serde(rename = "send-messages")]
    pub messages: Vec<OutgoingMessage>,
    #[serde(rename = "set-timeouts")]
    pub set_timeouts: Vec<TimerRequest>,
    #[serde(rename = "cleared-timeouts")]
    pub cleared_timeouts: Vec<TimerRequest>,
    pub states: BTreeMap<String, Value>,
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    let len = encoded.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames. A stream that ends inside a frame, or a frame that is not valid
/// JSON of the expected shape, is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map(Some).map_err(to_io_error)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
