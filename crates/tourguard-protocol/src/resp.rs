// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RESP2 value codec.
//!
//! Requests are always encoded as arrays of bulk strings. Replies can be any
//! of the five RESP2 kinds:
//! - `+simple\r\n`
//! - `-error message\r\n`
//! - `:123\r\n`
//! - `$5\r\nhello\r\n` (`$-1\r\n` for null)
//! - `*2\r\n...\r\n` (`*-1\r\n` for null), elements recursive

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted size of a single bulk string or array (64 MB).
pub const MAX_REPLY_SIZE: usize = 64 * 1024 * 1024;

/// Maximum nesting depth for array replies.
const MAX_DEPTH: usize = 8;

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reply too large: {0} bytes (max: {MAX_REPLY_SIZE})")]
    ReplyTooLarge(usize),

    #[error("invalid reply prefix: {0:?}")]
    InvalidPrefix(char),

    #[error("invalid length in reply: {0}")]
    InvalidLength(String),

    #[error("reply nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,

    #[error("reply is not valid UTF-8")]
    InvalidUtf8,

    #[error("connection closed")]
    ConnectionClosed,
}

/// One decoded RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(String),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    /// String view over simple and bulk replies.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(s) | Self::Bulk(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; bulk strings holding an integer also qualify.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Bulk(s) | Self::Simple(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Consume an array reply.
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Whether the reply is `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Simple(s) if s == "OK")
    }
}

/// Encode a request as an array of bulk strings.
pub fn encode_request(args: &[String]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf
}

/// Write a request to an async writer and flush.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    args: &[String],
) -> Result<(), RespError> {
    let encoded = encode_request(args);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one RESP2 value from a buffered async reader.
pub async fn read_value<R: AsyncBufRead + Unpin + Send>(
    reader: &mut R,
) -> Result<RespValue, RespError> {
    read_value_depth(reader, 0).await
}

/// Read a `\r\n`-terminated line, without the terminator.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, RespError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidData {
            RespError::InvalidUtf8
        } else {
            RespError::Io(e)
        }
    })?;
    if n == 0 {
        return Err(RespError::ConnectionClosed);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn read_value_depth<'a, R: AsyncBufRead + Unpin + Send>(
    reader: &'a mut R,
    depth: usize,
) -> std::pin::Pin<Box<dyn Future<Output = Result<RespValue, RespError>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_DEPTH {
            return Err(RespError::TooDeep);
        }
        let line = read_line(reader).await?;
        let mut chars = line.chars();
        let prefix = chars.next().ok_or(RespError::ConnectionClosed)?;
        let rest: String = chars.collect();

        match prefix {
            '+' => Ok(RespValue::Simple(rest)),
            '-' => Ok(RespValue::Error(rest)),
            ':' => rest
                .parse()
                .map(RespValue::Integer)
                .map_err(|_| RespError::InvalidLength(rest)),
            '$' => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| RespError::InvalidLength(rest.clone()))?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }
                let len = len as usize;
                if len > MAX_REPLY_SIZE {
                    return Err(RespError::ReplyTooLarge(len));
                }
                let mut payload = vec![0u8; len + 2];
                reader.read_exact(&mut payload).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        RespError::ConnectionClosed
                    } else {
                        RespError::Io(e)
                    }
                })?;
                payload.truncate(len);
                String::from_utf8(payload)
                    .map(RespValue::Bulk)
                    .map_err(|_| RespError::InvalidUtf8)
            }
            '*' => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| RespError::InvalidLength(rest.clone()))?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }
                let len = len as usize;
                if len > MAX_REPLY_SIZE {
                    return Err(RespError::ReplyTooLarge(len));
                }
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(read_value_depth(reader, depth + 1).await?);
                }
                Ok(RespValue::Array(items))
            }
            other => Err(RespError::InvalidPrefix(other)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(input: &str) -> Result<RespValue, RespError> {
        let mut reader = BufReader::new(Cursor::new(input.as_bytes().to_vec()));
        read_value(&mut reader).await
    }

    #[test]
    fn test_encode_request() {
        let args = vec!["GET".to_string(), "tourists".to_string(), "u1".to_string()];
        let encoded = encode_request(&args);
        assert_eq!(
            &encoded[..],
            b"*3\r\n$3\r\nGET\r\n$8\r\ntourists\r\n$2\r\nu1\r\n"
        );
    }

    #[test]
    fn test_encode_request_empty_arg() {
        let args = vec!["SET".to_string(), String::new()];
        let encoded = encode_request(&args);
        assert_eq!(&encoded[..], b"*2\r\n$3\r\nSET\r\n$0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_parse_simple() {
        assert_eq!(parse("+OK\r\n").await.unwrap(), RespValue::Simple("OK".into()));
        assert!(parse("+OK\r\n").await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_parse_error() {
        let v = parse("-ERR key not found\r\n").await.unwrap();
        assert_eq!(v, RespValue::Error("ERR key not found".into()));
    }

    #[tokio::test]
    async fn test_parse_integer() {
        assert_eq!(parse(":42\r\n").await.unwrap(), RespValue::Integer(42));
        assert_eq!(parse(":-1\r\n").await.unwrap(), RespValue::Integer(-1));
    }

    #[tokio::test]
    async fn test_parse_bulk() {
        let v = parse("$5\r\nhello\r\n").await.unwrap();
        assert_eq!(v, RespValue::Bulk("hello".into()));
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[tokio::test]
    async fn test_parse_bulk_embedded_crlf() {
        let v = parse("$12\r\nhello\r\nworld\r\n").await.unwrap();
        assert_eq!(v, RespValue::Bulk("hello\r\nworld".into()));
    }

    #[tokio::test]
    async fn test_parse_null_bulk() {
        assert_eq!(parse("$-1\r\n").await.unwrap(), RespValue::Null);
    }

    #[tokio::test]
    async fn test_parse_array() {
        let v = parse("*2\r\n$2\r\nu1\r\n:7\r\n").await.unwrap();
        assert_eq!(
            v,
            RespValue::Array(vec![RespValue::Bulk("u1".into()), RespValue::Integer(7)])
        );
    }

    #[tokio::test]
    async fn test_parse_nested_array() {
        let v = parse("*1\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n").await.unwrap();
        let outer = v.into_array().unwrap();
        assert_eq!(outer.len(), 1);
        let inner = outer[0].clone().into_array().unwrap();
        assert_eq!(inner.len(), 2);
    }

    #[tokio::test]
    async fn test_parse_null_array() {
        assert_eq!(parse("*-1\r\n").await.unwrap(), RespValue::Null);
    }

    #[tokio::test]
    async fn test_parse_invalid_prefix() {
        assert!(matches!(
            parse("@boom\r\n").await,
            Err(RespError::InvalidPrefix('@'))
        ));
    }

    #[tokio::test]
    async fn test_parse_empty_stream() {
        assert!(matches!(parse("").await, Err(RespError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_parse_truncated_bulk() {
        assert!(matches!(
            parse("$10\r\nshort\r\n").await,
            Err(RespError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reply_too_large() {
        let huge = format!("${}\r\n", MAX_REPLY_SIZE + 1);
        assert!(matches!(
            parse(&huge).await,
            Err(RespError::ReplyTooLarge(_))
        ));
    }

    #[test]
    fn test_as_int_from_bulk() {
        assert_eq!(RespValue::Bulk("17".into()).as_int(), Some(17));
        assert_eq!(RespValue::Bulk("x".into()).as_int(), None);
    }

    #[test]
    fn test_round_trip_through_parser() {
        // Encoded requests are themselves valid RESP arrays.
        let args = vec!["PING".to_string()];
        let encoded = encode_request(&args);
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let parsed = rt.block_on(async {
            let mut reader = BufReader::new(Cursor::new(encoded.to_vec()));
            read_value(&mut reader).await.unwrap()
        });
        assert_eq!(
            parsed,
            RespValue::Array(vec![RespValue::Bulk("PING".into())])
        );
    }
}
