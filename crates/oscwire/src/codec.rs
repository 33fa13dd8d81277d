//! OSC 1.0 message codec.
//!
//! One UDP datagram carries one OSC message. The layout is three
//! 4-byte-aligned regions:
//!
//! ```text
//! address      null-terminated string, padded to a 4-byte boundary
//! type tags    "," followed by one tag per argument, padded likewise
//! arguments    big-endian payloads in tag order (T/F/N carry no bytes)
//! ```
//!
//! Only the tags the DAW remote script actually produces are supported:
//! `i` (i32), `f` (f32), `s` (string), `h` (i64), `d` (f64), and the
//! payload-less `T`/`F`/`N`. Bundles (`#bundle` packets) are rejected with a
//! typed error; the remote script never sends them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A single OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bool(bool),
    Nil,
}

impl OscValue {
    /// Integer view, widening `Int` and narrowing `Long` when it fits.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            OscValue::Int(v) => Some(*v),
            OscValue::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Float view. The remote script is loose about numeric tags (a
    /// parameter minimum of zero may arrive as `i`), so integers coerce.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            OscValue::Float(v) => Some(*v),
            OscValue::Double(v) => Some(*v as f32),
            OscValue::Int(v) => Some(*v as f32),
            OscValue::Long(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            OscValue::Int(_) => b'i',
            OscValue::Long(_) => b'h',
            OscValue::Float(_) => b'f',
            OscValue::Double(_) => b'd',
            OscValue::Str(_) => b's',
            OscValue::Bool(true) => b'T',
            OscValue::Bool(false) => b'F',
            OscValue::Nil => b'N',
        }
    }
}

impl From<i32> for OscValue {
    fn from(v: i32) -> Self {
        OscValue::Int(v)
    }
}

impl From<f32> for OscValue {
    fn from(v: f32) -> Self {
        OscValue::Float(v)
    }
}

impl From<&str> for OscValue {
    fn from(v: &str) -> Self {
        OscValue::Str(v.to_string())
    }
}

/// A decoded OSC message: address plus argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscValue>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscValue>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Encode into a single datagram payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        put_padded_str(&mut buf, &self.address);

        let mut tags = Vec::with_capacity(self.args.len() + 1);
        tags.push(b',');
        tags.extend(self.args.iter().map(OscValue::type_tag));
        put_padded_bytes(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscValue::Int(v) => buf.put_i32(*v),
                OscValue::Long(v) => buf.put_i64(*v),
                OscValue::Float(v) => buf.put_f32(*v),
                OscValue::Double(v) => buf.put_f64(*v),
                OscValue::Str(s) => put_padded_str(&mut buf, s),
                OscValue::Bool(_) | OscValue::Nil => {}
            }
        }

        buf.freeze()
    }

    /// Decode one datagram payload.
    pub fn decode(datagram: &[u8]) -> Result<Self, OscError> {
        if datagram.starts_with(b"#bundle") {
            return Err(OscError::Bundle);
        }

        let mut buf = datagram;
        let address = take_padded_str(&mut buf, "address")?;
        if !address.starts_with('/') {
            return Err(OscError::BadAddress(address));
        }

        let tags = take_padded_str(&mut buf, "type tags")?;
        let tags = tags
            .strip_prefix(',')
            .ok_or(OscError::MissingTypeTags)?
            .as_bytes()
            .to_vec();

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags {
            args.push(take_arg(&mut buf, tag)?);
        }

        Ok(Self { address, args })
    }
}

/// Errors raised while decoding a datagram.
#[derive(Debug, thiserror::Error)]
pub enum OscError {
    #[error("OSC bundles are not supported")]
    Bundle,
    #[error("address does not start with '/': {0:?}")]
    BadAddress(String),
    #[error("type tag string does not start with ','")]
    MissingTypeTags,
    #[error("unsupported type tag '{0}'")]
    UnsupportedTag(char),
    #[error("datagram truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    put_padded_bytes(buf, s.as_bytes());
}

fn put_padded_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes);
    // Null terminator plus padding out to the next 4-byte boundary.
    let pad = 4 - (bytes.len() % 4);
    buf.put_bytes(0, pad);
}

fn take_padded_str(buf: &mut &[u8], what: &'static str) -> Result<String, OscError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(OscError::Truncated(what))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| OscError::InvalidUtf8(what))?
        .to_string();
    let advance = (end / 4 + 1) * 4;
    if advance > buf.len() {
        return Err(OscError::Truncated(what));
    }
    buf.advance(advance);
    Ok(s)
}

fn take_arg(buf: &mut &[u8], tag: u8) -> Result<OscValue, OscError> {
    match tag {
        b'i' => {
            ensure_remaining(*buf, 4, "i32 argument")?;
            Ok(OscValue::Int(buf.get_i32()))
        }
        b'h' => {
            ensure_remaining(*buf, 8, "i64 argument")?;
            Ok(OscValue::Long(buf.get_i64()))
        }
        b'f' => {
            ensure_remaining(*buf, 4, "f32 argument")?;
            Ok(OscValue::Float(buf.get_f32()))
        }
        b'd' => {
            ensure_remaining(*buf, 8, "f64 argument")?;
            Ok(OscValue::Double(buf.get_f64()))
        }
        b's' => Ok(OscValue::Str(take_padded_str(buf, "string argument")?)),
        b'T' => Ok(OscValue::Bool(true)),
        b'F' => Ok(OscValue::Bool(false)),
        b'N' => Ok(OscValue::Nil),
        other => Err(OscError::UnsupportedTag(other as char)),
    }
}

fn ensure_remaining(buf: &[u8], needed: usize, what: &'static str) -> Result<(), OscError> {
    if buf.len() < needed {
        Err(OscError::Truncated(what))
    } else {
        Ok(())
    }
}
