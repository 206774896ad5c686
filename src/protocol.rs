//! Wire protocol: length-prefixed binary records over a single TCP
//! connection per viewer.
//!
//! Framing is `[4-byte big-endian length][1-byte type][payload]`, where
//! `length` covers the type byte plus the payload. This mirrors the
//! small explicit framing layer `webrtc_streamer.rs` uses for SDP/ICE
//! messages (length-prefixed JSON over the WebSocket text channel); here
//! the framing is binary end to end since both video and control traffic
//! share one connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

pub const TYPE_HELLO: u8 = 1;
pub const TYPE_AUTH: u8 = 2;
pub const TYPE_AUTH_OK: u8 = 3;
pub const TYPE_AUTH_FAIL: u8 = 4;
pub const TYPE_SET_STREAM: u8 = 5;
pub const TYPE_STREAM_ACCEPTED: u8 = 6;
pub const TYPE_STREAM_STATE: u8 = 7;
pub const TYPE_CSD: u8 = 8;
pub const TYPE_FRAME: u8 = 9;
pub const TYPE_CONTROL: u8 = 10;
pub const TYPE_AUDIO_DOWN: u8 = 11;
pub const TYPE_AUDIO_UP: u8 = 12;

/// `STREAM_STATE` codes sent to drive a viewer's UI state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStateCode {
    Streaming = 1,
    Reconfiguring = 2,
    Stopped = 3,
}

/// A decoded, still-unparsed wire record: type byte plus payload.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub rtype: u8,
    pub payload: Bytes,
}

/// Read one framed record from `stream`. Rejects any declared length
/// above `max_payload_bytes` before allocating, per the oversize-payload
/// guard in the design.
pub async fn read_record<S>(
    stream: &mut S,
    max_payload_bytes: usize,
) -> Result<RawRecord, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(SessionError::ProtocolViolation(
            "zero-length record".to_string(),
        ));
    }
    if len > max_payload_bytes {
        return Err(SessionError::ProtocolViolation(format!(
            "record length {len} exceeds max_frame_payload_bytes {max_payload_bytes}"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let rtype = body[0];
    let payload = Bytes::copy_from_slice(&body[1..]);
    Ok(RawRecord { rtype, payload })
}

/// Write one framed record to `stream`.
pub async fn write_record<S>(stream: &mut S, rtype: u8, payload: &[u8]) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32((payload.len() + 1) as u32);
    buf.put_u8(rtype);
    buf.put_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Write two records back to back inside a single writer-lock critical
/// section, guaranteeing they appear adjacent on the wire (used for the
/// `STREAM_ACCEPTED` + `STREAM_STATE|RECONFIGURING` atomic pair).
pub async fn write_records_atomic<S>(
    stream: &mut S,
    records: &[(u8, &[u8])],
) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    for (rtype, payload) in records {
        buf.put_u32((payload.len() + 1) as u32);
        buf.put_u8(*rtype);
        buf.put_slice(payload);
    }
    stream.write_all(&buf).await?;
    Ok(())
}

/// Parse a `SET_STREAM` / `STREAM_ACCEPTED`-style `key=value|key=value`
/// text payload into a lookup table.
pub fn parse_kv(text: &str) -> std::collections::HashMap<&str, &str> {
    text.split('|')
        .filter_map(|kv| kv.split_once('='))
        .collect()
}

/// Encode a `STREAM_STATE` payload: `<code>|epoch=N`.
pub fn encode_stream_state(code: StreamStateCode, epoch: u64) -> String {
    format!("{}|epoch={}", code as u8, epoch)
}

/// Encode a `STREAM_ACCEPTED` payload.
pub fn encode_stream_accepted(
    epoch: u64,
    width: u32,
    height: u32,
    bitrate_bps: u32,
    fps: u32,
    session_id: &str,
) -> String {
    format!(
        "epoch={epoch}|width={width}|height={height}|bitrate={bitrate_bps}|fps={fps}|session={session_id}"
    )
}

/// Annex-B NAL unit header types relevant to keyframe/CSD detection.
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_IDR: u8 = 5;

fn find_next_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            return Some((i, 3));
        }
        if i + 4 <= buf.len() && buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 0 && buf[i + 3] == 1
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Split an Annex-B bitstream into its constituent NAL units (without
/// start codes).
pub fn split_nal_units(buf: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let Some((mut start, mut start_len)) = find_next_start_code(buf, 0) else {
        return units;
    };
    start += start_len;
    loop {
        match find_next_start_code(buf, start) {
            Some((next, next_len)) => {
                units.push(&buf[start..next]);
                start = next + next_len;
                start_len = next_len;
                let _ = start_len;
            }
            None => {
                units.push(&buf[start..]);
                break;
            }
        }
    }
    units
}

fn nal_type(unit: &[u8]) -> Option<u8> {
    unit.first().map(|b| b & 0x1F)
}

/// True if `buf` (an Annex-B access unit) contains an IDR NAL.
pub fn is_keyframe(buf: &[u8]) -> bool {
    split_nal_units(buf)
        .iter()
        .any(|u| nal_type(u) == Some(NAL_TYPE_IDR))
}

/// Extract SPS/PPS NAL units (with their own payload, no start code) from
/// an Annex-B access unit, in encounter order.
pub fn extract_param_sets(buf: &[u8]) -> Vec<&[u8]> {
    split_nal_units(buf)
        .into_iter()
        .filter(|u| matches!(nal_type(u), Some(NAL_TYPE_SPS) | Some(NAL_TYPE_PPS)))
        .collect()
}

/// Constant-time byte comparison, used for AUTH record comparison to
/// avoid a timing side channel (open question resolution in `DESIGN.md`).
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_record_roundtrip() {
        let mut buf = Vec::new();
        write_record(&mut buf, TYPE_HELLO, b"hello").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let rec = read_record(&mut cursor, 1024).await.unwrap();
        assert_eq!(rec.rtype, TYPE_HELLO);
        assert_eq!(&rec.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_oversize_record_rejected() {
        let mut buf = Vec::new();
        write_record(&mut buf, TYPE_FRAME, &vec![0u8; 100]).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let err = read_record(&mut cursor, 10).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn test_parse_kv() {
        let kv = parse_kv("width=720|height=960|bitrate=2000000|fps=30");
        assert_eq!(kv.get("width"), Some(&"720"));
        assert_eq!(kv.get("fps"), Some(&"30"));
    }

    #[test]
    fn test_keyframe_detection() {
        // start code + IDR nal (type 5) + start code + non-key nal (type 1)
        let buf = [0, 0, 0, 1, 0x65, 0xAA, 0, 0, 1, 0x01, 0xBB];
        assert!(is_keyframe(&buf));
        let non_key = [0, 0, 0, 1, 0x01, 0xAA];
        assert!(!is_keyframe(&non_key));
    }

    #[test]
    fn test_extract_param_sets() {
        let buf = [
            0, 0, 0, 1, 0x67, 0xAA, 0xBB, // SPS (type 7)
            0, 0, 1, 0x68, 0xCC, // PPS (type 8)
            0, 0, 1, 0x65, 0xDD, // IDR
        ];
        let sets = extract_param_sets(&buf);
        assert_eq!(sets.len(), 2);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"short", b"longerstring"));
    }
}
