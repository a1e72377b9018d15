use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

/// Name the server announces right after the socket is accepted.
pub const PROTOCOL_NAME: &str = "TrackCtl Remote 1";

/// Method that carries a batch of staged calls in one round trip.
pub const MULTICALL_METHOD: &str = "system.multicall";

/// Upper bound for a single frame payload.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Payload length and handle, both little-endian u32.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound for the protocol name in the greeting.
pub const MAX_GREETING_LEN: u32 = 64;

// Server status codes
pub const STATUS_WAITING: i32 = 1;
pub const STATUS_LAUNCHING: i32 = 2;
pub const STATUS_SYNCHRONIZING: i32 = 3;
pub const STATUS_PLAYING: i32 = 4;
pub const STATUS_FINISHING: i32 = 5;
pub const STATUS_NO_CHALLENGE: i32 = 100;

/// Dynamically typed value carried by calls, replies and callbacks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub enum RpcValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Array(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        RpcValue::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RpcValue::Nil)
    }

    /// Integers are accepted as booleans, the way the server reports flags.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            RpcValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            RpcValue::Int(i) => Some(*i),
            RpcValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        match self {
            RpcValue::Struct(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn at(&self, index: usize) -> Option<&RpcValue> {
        self.as_array().and_then(|items| items.get(index))
    }

    /// Struct field as string, empty when absent.
    pub fn str_field(&self, key: &str) -> String {
        self.get(key)
            .and_then(RpcValue::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Struct field as integer, zero when absent.
    pub fn int_field(&self, key: &str) -> i64 {
        self.get(key).and_then(RpcValue::as_int).unwrap_or(0)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.get(key).and_then(RpcValue::as_bool).unwrap_or(false)
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Int(i64::from(value))
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        RpcValue::Int(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::Str(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::Str(value)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        RpcValue::Array(value)
    }
}

/// Server-side failure of a single request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Message {
    Call {
        method: String,
        params: Vec<RpcValue>,
    },
    Reply(Result<RpcValue, Fault>),
    Callback {
        method: String,
        params: Vec<RpcValue>,
    },
}

/// Encodes one frame: payload length, handle, then the encoded message.
pub fn encode_frame(handle: u32, message: &Message) -> bincode::Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| frame_too_large(payload.len()))?;

    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&handle.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Splits a frame header into payload length and handle.
pub fn parse_frame_header(header: [u8; FRAME_HEADER_LEN]) -> bincode::Result<(usize, u32)> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let handle = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if len > MAX_FRAME_LEN {
        return Err(frame_too_large(len as usize));
    }
    Ok((len as usize, handle))
}

pub fn write_frame<W: Write>(writer: &mut W, handle: u32, message: &Message) -> bincode::Result<()> {
    writer.write_all(&encode_frame(handle, message)?)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame written by [`write_frame`].
pub fn read_frame<R: Read>(reader: &mut R) -> bincode::Result<(u32, Message)> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let (len, handle) = parse_frame_header(header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let message = bincode::deserialize(&payload)?;
    Ok((handle, message))
}

/// Writes the protocol name greeting sent on accept.
pub fn write_greeting<W: Write>(writer: &mut W) -> std::io::Result<()> {
    let name = PROTOCOL_NAME.as_bytes();
    writer.write_all(&(name.len() as u32).to_le_bytes())?;
    writer.write_all(name)?;
    writer.flush()
}

fn frame_too_large(len: usize) -> bincode::Error {
    Box::new(bincode::ErrorKind::Custom(format!(
        "frame of {} bytes exceeds limit of {} bytes",
        len, MAX_FRAME_LEN
    )))
}

/// Builds the single parameter of a multicall from the staged calls.
pub fn encode_multicall(calls: &[(String, Vec<RpcValue>)]) -> RpcValue {
    RpcValue::Array(
        calls
            .iter()
            .map(|(method, params)| {
                RpcValue::object([
                    ("methodName", RpcValue::from(method.as_str())),
                    ("params", RpcValue::Array(params.clone())),
                ])
            })
            .collect(),
    )
}

/// Splits a multicall reply into per-call outcomes.
///
/// Successful items arrive wrapped in a one-element array, failed items as a
/// `faultCode`/`faultString` struct. Returns None when the reply has any
/// other shape, since the results can then no longer be matched to calls.
pub fn decode_multicall(reply: &RpcValue) -> Option<Vec<Result<RpcValue, Fault>>> {
    reply
        .as_array()?
        .iter()
        .map(|item| match item {
            RpcValue::Array(values) if values.len() == 1 => Some(Ok(values[0].clone())),
            RpcValue::Struct(fields) if fields.contains_key("faultCode") => Some(Err(Fault::new(
                item.int_field("faultCode") as i32,
                item.str_field("faultString"),
            ))),
            _ => None,
        })
        .collect()
}
