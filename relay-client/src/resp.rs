//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server responses over an async
//! buffered reader, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use relay_common::{CacheError, CacheResult};

/// Largest bulk string accepted, matching the server's default `proto-max-bulk-len`.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest array header accepted.
const MAX_ARRAY_LEN: i64 = 1 << 24;
/// Up-front reservation cap; larger payloads grow as bytes arrive.
const PREALLOCATE_LIMIT: usize = 64 * 1024;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays (SCAN pages, ROLE replies).
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
///
/// Boxed because arrays recurse.
pub fn read_response<'a, R>(
    reader: &'a mut R,
    line_buf: &'a mut Vec<u8>,
) -> BoxFuture<'a, CacheResult<RespValue>>
where
    R: AsyncBufRead + Unpin + Send,
{
    async move {
        read_line(reader, line_buf).await?;
        if line_buf.is_empty() {
            return Err(CacheError::Protocol);
        }

        match line_buf[0] {
            b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
            b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
            b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
            b'$' => {
                let len = parse_i64(&line_buf[1..])?;
                parse_bulk_len(reader, len, line_buf).await
            }
            b'*' => {
                let len = parse_i64(&line_buf[1..])?;
                if len <= 0 {
                    return Ok(RespValue::Array(Vec::new()));
                }
                if len > MAX_ARRAY_LEN {
                    return Err(CacheError::Protocol);
                }
                let mut items = Vec::with_capacity((len as usize).min(PREALLOCATE_LIMIT));
                for _ in 0..len {
                    items.push(read_response(reader, line_buf).await?);
                }
                Ok(RespValue::Array(items))
            }
            _ => Err(CacheError::Protocol),
        }
    }
    .boxed()
}

/// Reads a bulk payload of `len` bytes plus its CRLF.
///
/// **Input**: the length from a `$` header (negative means null).
/// **Output**: `RespValue::Bulk`, or `Protocol` for an oversized or
/// truncated payload.
///
/// **Logic**:
/// 1. Reject lengths above `MAX_BULK_LEN` before allocating.
/// 2. Reserve at most `PREALLOCATE_LIMIT` and read through a `take` limit.
/// 3. Require the trailing CRLF.
async fn parse_bulk_len<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> CacheResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len > MAX_BULK_LEN {
        return Err(CacheError::Protocol);
    }
    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(PREALLOCATE_LIMIT));
    (&mut *reader).take(len as u64).read_to_end(&mut data).await?;
    if data.len() != len {
        return Err(CacheError::Protocol);
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != [b'\r', b'\n'] {
        return Err(CacheError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> CacheResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 {
        return Err(CacheError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(CacheError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> CacheResult<i64> {
    if data.is_empty() {
        return Err(CacheError::Protocol);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(CacheError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &[u8]) -> CacheResult<RespValue> {
        let mut reader = raw;
        let mut line = Vec::new();
        read_response(&mut reader, &mut line).await
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[tokio::test]
    async fn parses_scalars() {
        assert_eq!(parse(b"+OK\r\n").await.unwrap(), RespValue::Simple(b"OK".to_vec()));
        assert_eq!(parse(b":-42\r\n").await.unwrap(), RespValue::Integer(-42));
        assert_eq!(
            parse(b"-READONLY replica\r\n").await.unwrap(),
            RespValue::Error(b"READONLY replica".to_vec())
        );
        assert_eq!(
            parse(b"$5\r\nhello\r\n").await.unwrap(),
            RespValue::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(parse(b"$-1\r\n").await.unwrap(), RespValue::Bulk(None));
    }

    #[tokio::test]
    async fn oversized_or_truncated_lengths_are_protocol_errors() {
        assert!(matches!(parse(b"$999999999999\r\n").await, Err(CacheError::Protocol)));
        assert!(matches!(parse(b"*999999999999\r\n").await, Err(CacheError::Protocol)));
        assert!(matches!(parse(b"$10\r\nshort\r\n").await, Err(CacheError::Protocol)));
        // A large but legal array header only allocates as items arrive.
        assert!(matches!(parse(b"*1000000\r\n:1\r\n").await, Err(CacheError::Protocol)));
    }

    #[tokio::test]
    async fn parses_nested_scan_page() {
        let raw = b"*2\r\n$2\r\n17\r\n*2\r\n$6\r\nuser:1\r\n$8\r\nuser:abc\r\n";
        assert_eq!(
            parse(raw).await.unwrap(),
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"17".to_vec())),
                RespValue::Array(vec![
                    RespValue::Bulk(Some(b"user:1".to_vec())),
                    RespValue::Bulk(Some(b"user:abc".to_vec())),
                ]),
            ])
        );
    }

    #[tokio::test]
    async fn rejects_bad_framing() {
        assert!(matches!(parse(b"+OK\n").await, Err(CacheError::Protocol)));
        assert!(matches!(parse(b"?what\r\n").await, Err(CacheError::Protocol)));
        assert!(matches!(parse(b":12a\r\n").await, Err(CacheError::Protocol)));
        assert!(matches!(parse(b"").await, Err(CacheError::Protocol)));
    }
}
