//! Framing contract plus the two shipped codecs. Grounded on
//! `handy::codec.h`/`codec.cc`'s `CodecBase`/`LineCodec`/`LengthCodec`.

use crate::buffer::{Buffer, Slice};
use crate::error::CodecError;

pub enum DecodeOutcome<'a> {
    NeedMore,
    Frame { consumed: usize, msg: Slice<'a> },
}

/// Decode/encode are pure with respect to the buffer's read position -
/// neither consumes; the caller (`TcpConn`'s message-dispatch wrapper)
/// performs the single `consume` call on success. Each connection needs
/// its own codec instance, so a configured codec is cloned per accepted
/// connection via `box_clone` rather than shared.
pub trait Codec: Send {
    fn try_decode<'a>(&mut self, input: &'a Buffer) -> Result<DecodeOutcome<'a>, CodecError>;
    fn encode(&self, msg: &[u8], out: &mut Buffer);
    fn box_clone(&self) -> Box<dyn Codec>;
}

/// `\r\n`- or bare-`\n`-terminated lines. A lone `0x04` (end-of-transmission)
/// byte is delivered as its own one-byte message.
#[derive(Clone, Default)]
pub struct LineCodec;

impl Codec for LineCodec {
    fn try_decode<'a>(&mut self, input: &'a Buffer) -> Result<DecodeOutcome<'a>, CodecError> {
        let data = input.as_slice();
        if data.is_empty() {
            return Ok(DecodeOutcome::NeedMore);
        }
        if data[0] == 0x04 {
            return Ok(DecodeOutcome::Frame {
                consumed: 1,
                msg: Slice::new(&data[..1]),
            });
        }
        match data.iter().position(|&b| b == b'\n') {
            None => Ok(DecodeOutcome::NeedMore),
            Some(pos) => {
                let end = if pos > 0 && data[pos - 1] == b'\r' { pos - 1 } else { pos };
                Ok(DecodeOutcome::Frame {
                    consumed: pos + 1,
                    msg: Slice::new(&data[..end]),
                })
            }
        }
    }

    fn encode(&self, msg: &[u8], out: &mut Buffer) {
        out.append(msg);
        out.append(b"\r\n");
    }

    fn box_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

const LENGTH_MAGIC: &[u8; 4] = b"mBdT";
const LENGTH_MAX: usize = 1 << 20;

/// `"mBdT"` magic || big-endian `i32` length || payload, capped at 1 MiB.
#[derive(Clone, Default)]
pub struct LengthCodec;

impl Codec for LengthCodec {
    fn try_decode<'a>(&mut self, input: &'a Buffer) -> Result<DecodeOutcome<'a>, CodecError> {
        let data = input.as_slice();
        if data.len() < 8 {
            return Ok(DecodeOutcome::NeedMore);
        }
        if &data[0..4] != LENGTH_MAGIC {
            return Err(CodecError("bad length-frame magic"));
        }
        let len = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if len < 0 || len as usize > LENGTH_MAX {
            return Err(CodecError("length-frame payload too large"));
        }
        let len = len as usize;
        let total = 8 + len;
        if data.len() < total {
            return Ok(DecodeOutcome::NeedMore);
        }
        Ok(DecodeOutcome::Frame {
            consumed: total,
            msg: Slice::new(&data[8..total]),
        })
    }

    fn encode(&self, msg: &[u8], out: &mut Buffer) {
        out.append(LENGTH_MAGIC);
        out.append(&(msg.len() as i32).to_be_bytes());
        out.append(msg);
    }

    fn box_clone(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame<'a>(buf: &'a Buffer, codec: &mut dyn Codec) -> DecodeOutcome<'a> {
        codec.try_decode(buf).unwrap()
    }

    #[test]
    fn length_codec_partial_then_complete() {
        let mut codec = LengthCodec;
        let mut buf = Buffer::new();
        buf.append(b"mBdT");
        buf.append(&5i32.to_be_bytes());
        buf.append(b"hel");
        match frame(&buf, &mut codec) {
            DecodeOutcome::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
        buf.append(b"lo");
        match frame(&buf, &mut codec) {
            DecodeOutcome::Frame { consumed, msg } => {
                assert_eq!(consumed, 13);
                assert_eq!(msg.as_bytes(), b"hello");
            }
            DecodeOutcome::NeedMore => panic!("expected a frame"),
        }
    }

    #[test]
    fn length_codec_bad_magic_errors() {
        let mut codec = LengthCodec;
        let mut buf = Buffer::new();
        buf.append(b"XXXX");
        buf.append(&1i32.to_be_bytes());
        buf.append(b"a");
        assert!(codec.try_decode(&buf).is_err());
    }

    #[test]
    fn length_codec_oversized_errors() {
        let mut codec = LengthCodec;
        let mut buf = Buffer::new();
        buf.append(b"mBdT");
        buf.append(&((LENGTH_MAX as i32) + 1).to_be_bytes());
        buf.append(b"xxxxxxxx");
        assert!(codec.try_decode(&buf).is_err());
    }

    #[test]
    fn line_codec_mixed_terminators() {
        let mut codec = LineCodec;
        let mut buf = Buffer::new();
        buf.append(b"ab\r\ncd\n");
        match frame(&buf, &mut codec) {
            DecodeOutcome::Frame { consumed, msg } => {
                assert_eq!(consumed, 4);
                assert_eq!(msg.as_bytes(), b"ab");
            }
            DecodeOutcome::NeedMore => panic!(),
        }
        buf.consume(4);
        match frame(&buf, &mut codec) {
            DecodeOutcome::Frame { consumed, msg } => {
                assert_eq!(consumed, 3);
                assert_eq!(msg.as_bytes(), b"cd");
            }
            DecodeOutcome::NeedMore => panic!(),
        }
    }

    #[test]
    fn line_codec_eot_byte() {
        let mut codec = LineCodec;
        let mut buf = Buffer::new();
        buf.append(&[0x04]);
        match frame(&buf, &mut codec) {
            DecodeOutcome::Frame { consumed, msg } => {
                assert_eq!(consumed, 1);
                assert_eq!(msg.as_bytes(), &[0x04]);
            }
            DecodeOutcome::NeedMore => panic!(),
        }
    }

    #[test]
    fn length_codec_round_trip() {
        let mut codec = LengthCodec;
        let mut buf = Buffer::new();
        codec.encode(b"round trip payload", &mut buf);
        match frame(&buf, &mut codec) {
            DecodeOutcome::Frame { consumed, msg } => {
                assert_eq!(msg.as_bytes(), b"round trip payload");
                assert_eq!(consumed, buf.size());
            }
            DecodeOutcome::NeedMore => panic!(),
        }
    }
}
