//! RESP reply frames.
//!
//! Command handlers build a [`Frame`]; the host serializes it onto the
//! client connection.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A RESP2 reply.
#[derive(Clone, PartialEq)]
pub enum Frame {
    /// Simple string (no newlines allowed)
    Simple(String),

    /// Error message
    Error(String),

    /// 64-bit signed integer
    Integer(i64),

    /// Bulk string (binary-safe)
    Bulk(Bytes),

    /// Null bulk string
    Null,

    /// Array of frames
    Array(Vec<Frame>),
}

impl Frame {
    /// Create a simple string frame.
    #[inline]
    pub fn simple(s: impl Into<String>) -> Self {
        Self::Simple(s.into())
    }

    /// Create an error frame.
    #[inline]
    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    /// Create an integer frame.
    #[inline]
    pub fn integer(n: i64) -> Self {
        Self::Integer(n)
    }

    /// Integer reply for a boolean outcome (1 or 0).
    #[inline]
    pub fn boolean(b: bool) -> Self {
        Self::Integer(i64::from(b))
    }

    /// Create a bulk string frame.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    /// Create a null frame.
    #[inline]
    pub const fn null() -> Self {
        Self::Null
    }

    /// Create an array frame.
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Self::Array(frames)
    }

    /// Create an OK response.
    #[inline]
    pub fn ok() -> Self {
        Self::Simple("OK".to_string())
    }

    /// Check if this is an error frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Try to get the frame as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(s) | Self::Error(s) => Some(s),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to get the frame as an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get the frame as an array.
    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Self::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Serialize the frame to a buffer.
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut digits = itoa::Buffer::new();
        match self {
            Self::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(digits.format(*n).as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(digits.format(data.len()).as_bytes());
                buf.put_slice(b"\r\n");
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Self::Null => buf.put_slice(b"$-1\r\n"),
            Self::Array(frames) => {
                buf.put_u8(b'*');
                buf.put_slice(digits.format(frames.len()).as_bytes());
                buf.put_slice(b"\r\n");
                for frame in frames {
                    frame.serialize(buf);
                }
            }
        }
    }

    /// Convert to a `Vec<u8>` for convenience.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.to_vec()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(s) => write!(f, "Simple({s:?})"),
            Self::Error(s) => write!(f, "Error({s:?})"),
            Self::Integer(n) => write!(f, "Integer({n})"),
            Self::Bulk(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "Bulk({s:?})"),
                Err(_) => write!(f, "Bulk({b:?})"),
            },
            Self::Null => write!(f, "Null"),
            Self::Array(arr) => f.debug_list().entries(arr).finish(),
        }
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self::Bulk(Bytes::from(s))
    }
}

impl From<i64> for Frame {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<Vec<Frame>> for Frame {
    fn from(frames: Vec<Frame>) -> Self {
        Self::Array(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_serialize() {
        assert_eq!(Frame::ok().to_vec(), b"+OK\r\n");
        assert_eq!(Frame::error("ERR not found").to_vec(), b"-ERR not found\r\n");
        assert_eq!(Frame::integer(-1).to_vec(), b":-1\r\n");
        assert_eq!(Frame::boolean(true).to_vec(), b":1\r\n");
        assert_eq!(Frame::null().to_vec(), b"$-1\r\n");
        assert_eq!(Frame::bulk("").to_vec(), b"$0\r\n\r\n");
    }

    #[test]
    fn test_nested_array_serialize() {
        let frame = Frame::array(vec![
            Frame::bulk("Capacity"),
            Frame::integer(100),
            Frame::array(vec![Frame::integer(1), Frame::error("ERR bad")]),
        ]);
        assert_eq!(
            frame.to_vec(),
            b"*3\r\n$8\r\nCapacity\r\n:100\r\n*2\r\n:1\r\n-ERR bad\r\n"
        );
    }
}
