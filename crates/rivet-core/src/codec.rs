//! Binary wire codec.
//!
//! Framing is length-prefixed by the three section lengths in the fixed
//! header and streaming: [`decode`] consumes bytes from a contiguous buffer
//! and yields at most one complete frame per call, retaining any tail. All
//! multi-byte integers are big-endian.
//!
//! # Wire format
//!
//! ```text
//! v1 request:  proto(1)=0x01 type(1) cmdcode(2) ver2(1) requestId(4)
//!              codec(1) timeout(4) classLen(2) headerLen(2) contentLen(4)
//!              [className] [header] [content]
//! v1 response: ... codec(1) status(2) classLen(2) headerLen(2) contentLen(4) ...
//! v2:          proto(1)=0x02 switch(1) <v1 body> [crc32(4) if switch bit 0]
//! ```
//!
//! The v2 CRC32 covers the entire encoded frame up to the CRC field. A
//! mismatch fails that single frame (its length was already trusted, so its
//! bytes are consumed) without tearing the stream.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::{Command, CommandCode, CommandKind, RequestCommand, ResponseCommand};
use crate::error::{CodecError, StatusCode};
use crate::protocol::{ProtocolId, ProtocolManager, ProtocolSwitch};

/// Upper bound on a single frame; larger length fields tear the stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Result of one decode step.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough buffered bytes for a complete frame.
    Incomplete,
    Frame(Command),
    /// A complete frame was consumed but failed validation. The stream
    /// remains usable; the caller answers or fails the frame per its kind.
    Corrupt {
        id: u32,
        kind: CommandKind,
        error: CodecError,
    },
}

/// Encode one command using the given protocol selection.
pub fn encode(cmd: &Command, proto: ProtocolId, out: &mut BytesMut) -> Result<(), CodecError> {
    let descriptor = ProtocolManager::global()
        .get(proto.code)
        .ok_or(CodecError::UnknownProtocol(proto.code))?;

    let start = out.len();
    out.put_u8(proto.code);
    if descriptor.has_switch {
        out.put_u8(proto.switches.bits());
    }

    match cmd {
        Command::Request(req) => {
            out.put_u8(req.kind as u8);
            out.put_u16(req.code as u16);
            out.put_u8(req.ver2);
            out.put_u32(req.id);
            out.put_u8(req.codec);
            out.put_i32(req.timeout_ms);
            out.put_u16(req.class_name.len() as u16);
            out.put_u16(req.header.len() as u16);
            out.put_u32(req.content.len() as u32);
            out.put_slice(req.class_name.as_bytes());
            out.put_slice(&req.header);
            out.put_slice(&req.content);
        }
        Command::Response(resp) => {
            out.put_u8(CommandKind::Response as u8);
            out.put_u16(resp.code as u16);
            out.put_u8(resp.ver2);
            out.put_u32(resp.id);
            out.put_u8(resp.codec);
            out.put_u16(resp.status as u16);
            out.put_u16(resp.class_name.len() as u16);
            out.put_u16(resp.header.len() as u16);
            out.put_u32(resp.content.len() as u32);
            out.put_slice(resp.class_name.as_bytes());
            out.put_slice(&resp.header);
            out.put_slice(&resp.content);
        }
    }

    if descriptor.has_switch && proto.switches.contains(ProtocolSwitch::CRC) {
        let crc = crc32fast::hash(&out[start..]);
        out.put_u32(crc);
    }
    Ok(())
}

/// Decode at most one frame from the front of `buf`.
///
/// `Ok(Decoded::Incomplete)` leaves the buffer untouched; `Frame` and
/// `Corrupt` consume exactly the frame's bytes. A hard `Err` means framing
/// is lost and the connection must close.
pub fn decode(buf: &mut BytesMut) -> Result<Decoded, CodecError> {
    if buf.is_empty() {
        return Ok(Decoded::Incomplete);
    }
    let proto = buf[0];
    let descriptor = ProtocolManager::global()
        .get(proto)
        .ok_or(CodecError::UnknownProtocol(proto))?;
    // Offset of the type byte: the v2 header carries a switch byte first.
    let base = if descriptor.has_switch { 2 } else { 1 };
    if buf.len() < base + 1 {
        return Ok(Decoded::Incomplete);
    }
    let switches = if descriptor.has_switch {
        ProtocolSwitch::from_bits_truncate(buf[1])
    } else {
        ProtocolSwitch::empty()
    };

    let kind_byte = buf[base];
    let kind = CommandKind::from_u8(kind_byte).ok_or(CodecError::UnknownCommandType(kind_byte))?;
    // Fixed header past the type byte: cmdcode(2) ver2(1) id(4) codec(1)
    // plus timeout(4) for requests or status(2) for responses, plus the
    // three section lengths (2+2+4).
    let fixed = base
        + match kind {
            CommandKind::Response => 19,
            CommandKind::Request | CommandKind::Oneway => 21,
        };
    if buf.len() < fixed {
        return Ok(Decoded::Incomplete);
    }

    let b: &[u8] = &buf[..];
    let cmdcode_raw = u16::from_be_bytes([b[base + 1], b[base + 2]]);
    let code =
        CommandCode::from_u16(cmdcode_raw).ok_or(CodecError::UnknownCommandCode(cmdcode_raw))?;
    let ver2 = b[base + 3];
    let id = u32::from_be_bytes([b[base + 4], b[base + 5], b[base + 6], b[base + 7]]);
    let codec = b[base + 8];

    let lens_at = match kind {
        CommandKind::Response => base + 11,
        CommandKind::Request | CommandKind::Oneway => base + 13,
    };
    let class_len = u16::from_be_bytes([b[lens_at], b[lens_at + 1]]) as usize;
    let header_len = u16::from_be_bytes([b[lens_at + 2], b[lens_at + 3]]) as usize;
    let content_len = u32::from_be_bytes([
        b[lens_at + 4],
        b[lens_at + 5],
        b[lens_at + 6],
        b[lens_at + 7],
    ]) as usize;

    let crc_len = if switches.contains(ProtocolSwitch::CRC) {
        4
    } else {
        0
    };
    let total = fixed + class_len + header_len + content_len + crc_len;
    if total > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len: total,
            max: MAX_FRAME_LEN,
        });
    }
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    // The full frame is buffered: consume it, then validate.
    let frame: Bytes = buf.split_to(total).freeze();

    if crc_len > 0 {
        let expected = u32::from_be_bytes([
            frame[total - 4],
            frame[total - 3],
            frame[total - 2],
            frame[total - 1],
        ]);
        let actual = crc32fast::hash(&frame[..total - 4]);
        if actual != expected {
            return Ok(Decoded::Corrupt {
                id,
                kind,
                error: CodecError::CrcMismatch { expected, actual },
            });
        }
    }

    let class_name = match String::from_utf8(frame[fixed..fixed + class_len].to_vec()) {
        Ok(name) => name,
        Err(e) => {
            return Ok(Decoded::Corrupt {
                id,
                kind,
                error: CodecError::BadClassName(e),
            });
        }
    };
    let header = frame.slice(fixed + class_len..fixed + class_len + header_len);
    let content =
        frame.slice(fixed + class_len + header_len..fixed + class_len + header_len + content_len);

    let cmd = match kind {
        CommandKind::Request | CommandKind::Oneway => {
            let timeout_ms = i32::from_be_bytes([
                frame[base + 9],
                frame[base + 10],
                frame[base + 11],
                frame[base + 12],
            ]);
            Command::Request(RequestCommand {
                id,
                code,
                kind,
                ver2,
                codec,
                timeout_ms,
                class_name,
                header,
                content,
                arrive_at: Some(Instant::now()),
            })
        }
        CommandKind::Response => {
            let status_raw = u16::from_be_bytes([frame[base + 9], frame[base + 10]]);
            // An unclassifiable status stays deliverable rather than fatal.
            let status = StatusCode::from_u16(status_raw).unwrap_or(StatusCode::Unknown);
            Command::Response(ResponseCommand {
                id,
                code,
                ver2,
                codec,
                status,
                class_name,
                header,
                content,
            })
        }
    };
    Ok(Decoded::Frame(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::CODEC_JSON;

    fn request(id: u32, kind: CommandKind) -> RequestCommand {
        let mut req = RequestCommand::new(
            kind,
            CODEC_JSON,
            if kind == CommandKind::Oneway { 0 } else { 500 },
            "Ping".to_string(),
            Bytes::from_static(b"hdr"),
            Bytes::from_static(b"\"hello\""),
        );
        req.id = id;
        req
    }

    fn decode_one(buf: &mut BytesMut) -> Command {
        match decode(buf).unwrap() {
            Decoded::Frame(cmd) => cmd,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn v1_request_round_trip() {
        let req = request(7, CommandKind::Request);
        let mut buf = BytesMut::new();
        encode(&Command::Request(req.clone()), ProtocolId::v1(), &mut buf).unwrap();

        let decoded = decode_one(&mut buf);
        assert!(buf.is_empty());
        match decoded {
            Command::Request(got) => {
                assert_eq!(got.id, 7);
                assert_eq!(got.kind, CommandKind::Request);
                assert_eq!(got.code, CommandCode::RpcRequest);
                assert_eq!(got.timeout_ms, 500);
                assert_eq!(got.class_name, "Ping");
                assert_eq!(&got.header[..], b"hdr");
                assert_eq!(&got.content[..], b"\"hello\"");
                assert!(got.arrive_at.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn v1_response_round_trip() {
        let resp = ResponseCommand::success(
            9,
            1,
            CODEC_JSON,
            "Pong".to_string(),
            Bytes::from_static(b"\"ok\""),
        );
        let mut buf = BytesMut::new();
        encode(&Command::Response(resp), ProtocolId::v1(), &mut buf).unwrap();

        match decode_one(&mut buf) {
            Command::Response(got) => {
                assert_eq!(got.id, 9);
                assert_eq!(got.status, StatusCode::Success);
                assert_eq!(got.class_name, "Pong");
                assert_eq!(&got.content[..], b"\"ok\"");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn oneway_and_heartbeat_frames() {
        let mut buf = BytesMut::new();
        encode(
            &Command::Request(request(1, CommandKind::Oneway)),
            ProtocolId::v1(),
            &mut buf,
        )
        .unwrap();
        let mut hb = RequestCommand::heartbeat();
        hb.id = 2;
        encode(&Command::Request(hb), ProtocolId::v1(), &mut buf).unwrap();

        match decode_one(&mut buf) {
            Command::Request(got) => assert_eq!(got.kind, CommandKind::Oneway),
            other => panic!("unexpected: {other:?}"),
        }
        match decode_one(&mut buf) {
            Command::Request(got) => {
                assert_eq!(got.code, CommandCode::Heartbeat);
                assert!(got.class_name.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn streaming_partial_feed() {
        let req = request(3, CommandKind::Request);
        let mut full = BytesMut::new();
        encode(&Command::Request(req), ProtocolId::v1(), &mut full).unwrap();
        let full = full.freeze();

        let mut buf = BytesMut::new();
        // Feed one byte at a time; only the final byte completes the frame.
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            if i + 1 < full.len() {
                assert!(matches!(decode(&mut buf).unwrap(), Decoded::Incomplete));
            }
        }
        match decode(&mut buf).unwrap() {
            Decoded::Frame(Command::Request(got)) => assert_eq!(got.id, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn v2_crc_round_trip() {
        let proto = ProtocolId::v2(ProtocolSwitch::CRC);
        let req = request(11, CommandKind::Request);
        let mut buf = BytesMut::new();
        encode(&Command::Request(req), proto, &mut buf).unwrap();

        match decode(&mut buf).unwrap() {
            Decoded::Frame(Command::Request(got)) => assert_eq!(got.id, 11),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn v2_crc_mismatch_consumes_single_frame() {
        let proto = ProtocolId::v2(ProtocolSwitch::CRC);
        let mut buf = BytesMut::new();
        encode(
            &Command::Request(request(21, CommandKind::Request)),
            proto,
            &mut buf,
        )
        .unwrap();
        let first_len = buf.len();
        encode(
            &Command::Request(request(22, CommandKind::Request)),
            proto,
            &mut buf,
        )
        .unwrap();

        // Flip a content byte inside the first frame.
        buf[first_len - 6] ^= 0xff;

        match decode(&mut buf).unwrap() {
            Decoded::Corrupt { id, kind, error } => {
                assert_eq!(id, 21);
                assert_eq!(kind, CommandKind::Request);
                assert!(matches!(error, CodecError::CrcMismatch { .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The stream is not torn: the next frame decodes cleanly.
        match decode(&mut buf).unwrap() {
            Decoded::Frame(Command::Request(got)) => assert_eq!(got.id, 22),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_protocol_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        assert!(matches!(
            decode(&mut buf),
            Err(CodecError::UnknownProtocol(0x7f))
        ));
    }

    #[test]
    fn unknown_status_maps_to_unknown() {
        let resp = ResponseCommand::success(5, 1, CODEC_JSON, String::new(), Bytes::new());
        let mut buf = BytesMut::new();
        encode(&Command::Response(resp), ProtocolId::v1(), &mut buf).unwrap();
        // Overwrite the status field (offset 10 in v1) with an unassigned value.
        buf[10] = 0xff;
        buf[11] = 0xff;
        match decode(&mut buf).unwrap() {
            Decoded::Frame(Command::Response(got)) => {
                assert_eq!(got.status, StatusCode::Unknown)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn oversized_length_field_is_fatal() {
        let mut buf = BytesMut::new();
        encode(
            &Command::Request(request(1, CommandKind::Request)),
            ProtocolId::v1(),
            &mut buf,
        )
        .unwrap();
        // Corrupt the content length to something absurd.
        buf[18] = 0xff;
        buf[19] = 0xff;
        buf[20] = 0xff;
        buf[21] = 0xff;
        assert!(matches!(
            decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
