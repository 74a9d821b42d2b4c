//! Frame Codec (spec.md §4.3).
//!
//! Grounded on `neutronium/src/net/frame.rs` (opcode-tagged enum, a
//! `read(buffer, category)` / `write<W: SizedWrite>` pair) but reshaped for
//! a fixed 12-byte header with 24-bit port fields rather than the teacher's
//! variable-length TCP framing, using `byteorder` for the 16-bit fields the
//! same way `frame.rs` does.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::support::{SizedRead, SizedWrite};

/// Private ethertype carrying adapter frames inside the overlay's virtual
/// Ethernet.
pub const ETHERTYPE: u16 = 0x0901;

/// Wire protocol version this codec speaks.
pub const VERSION: u16 = 1;

/// Fixed header size, before any opcode-specific body.
pub const HEADER_LEN: usize = 12;

/// Size of the `data`/`data-more` body header (msg_id, frag_size, frag_no,
/// n_frags — four big-endian `u16`s), before the payload bytes.
pub const DATA_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Data = 0x00,
    DataMore = 0x01,
    ConnReq = 0x10,
    ConnAck = 0x12,
    DiscReq = 0x20,
    PingReq = 0x30,
    PingAck = 0x32,
    Error = 0x40,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Opcode> {
        Some(match v {
            0x00 => Opcode::Data,
            0x01 => Opcode::DataMore,
            0x10 => Opcode::ConnReq,
            0x12 => Opcode::ConnAck,
            0x20 => Opcode::DiscReq,
            0x30 => Opcode::PingReq,
            0x32 => Opcode::PingAck,
            0x40 => Opcode::Error,
            _ => return None,
        })
    }

    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Data | Opcode::DataMore)
    }
}

/// A fully decoded adapter frame, header fields plus opcode-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        dest_port: u32,
        src_port: u32,
        more: bool,
        msg_id: u16,
        frag_size: u16,
        frag_no: u16,
        n_frags: u16,
        payload: Vec<u8>,
    },
    ConnReq {
        dest_port: u32,
        src_port: u32,
        proto: u16,
    },
    ConnAck {
        dest_port: u32,
        src_port: u32,
        proto: u16,
    },
    DiscReq {
        dest_port: u32,
        src_port: u32,
    },
    PingReq {
        dest_port: u32,
        src_port: u32,
    },
    PingAck {
        dest_port: u32,
        src_port: u32,
    },
    Error {
        dest_port: u32,
        src_port: u32,
        code: u8,
        message: String,
    },
}

impl Frame {
    pub fn dest_port(&self) -> u32 {
        match *self {
            Frame::Data { dest_port, .. }
            | Frame::ConnReq { dest_port, .. }
            | Frame::ConnAck { dest_port, .. }
            | Frame::DiscReq { dest_port, .. }
            | Frame::PingReq { dest_port, .. }
            | Frame::PingAck { dest_port, .. }
            | Frame::Error { dest_port, .. } => dest_port,
        }
    }

    pub fn src_port(&self) -> u32 {
        match *self {
            Frame::Data { src_port, .. }
            | Frame::ConnReq { src_port, .. }
            | Frame::ConnAck { src_port, .. }
            | Frame::DiscReq { src_port, .. }
            | Frame::PingReq { src_port, .. }
            | Frame::PingAck { src_port, .. }
            | Frame::Error { src_port, .. } => src_port,
        }
    }
}

fn write_u24<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u8((v >> 16) as u8)?;
    w.write_u8((v >> 8) as u8)?;
    w.write_u8(v as u8)
}

fn read_u24<R: Read>(r: &mut R) -> io::Result<u32> {
    let b0 = r.read_u8()? as u32;
    let b1 = r.read_u8()? as u32;
    let b2 = r.read_u8()? as u32;
    Ok((b0 << 16) | (b1 << 8) | b2)
}

fn write_header<W: Write>(
    w: &mut W,
    opcode: Opcode,
    dest_port: u32,
    src_port: u32,
) -> io::Result<()> {
    w.write_u8(opcode as u8)?;
    w.write_u8(0)?; // flags
    w.write_u16::<BigEndian>(VERSION)?;
    w.write_u8(0)?; // reserved
    write_u24(w, dest_port)?;
    w.write_u8(0)?; // reserved
    write_u24(w, src_port)
}

/// Encodes `frame` into a freshly allocated buffer, ready to hand to the
/// overlay host's `send_frame`.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 16);
    let cursor = Cursor::new(&mut buf);
    encode_into(frame, cursor).expect("encoding into a growable Vec cannot fail");
    buf
}

fn encode_into<W: Write>(frame: &Frame, mut w: W) -> io::Result<()> {
    match *frame {
        Frame::Data {
            dest_port,
            src_port,
            more,
            msg_id,
            frag_size,
            frag_no,
            n_frags,
            ref payload,
        } => {
            let opcode = if more { Opcode::DataMore } else { Opcode::Data };
            write_header(&mut w, opcode, dest_port, src_port)?;
            w.write_u16::<BigEndian>(msg_id)?;
            w.write_u16::<BigEndian>(frag_size)?;
            w.write_u16::<BigEndian>(frag_no)?;
            w.write_u16::<BigEndian>(n_frags)?;
            w.write_all(payload)?;
        }
        Frame::ConnReq {
            dest_port,
            src_port,
            proto,
        } => {
            write_header(&mut w, Opcode::ConnReq, dest_port, src_port)?;
            w.write_u16::<BigEndian>(proto)?;
        }
        Frame::ConnAck {
            dest_port,
            src_port,
            proto,
        } => {
            write_header(&mut w, Opcode::ConnAck, dest_port, src_port)?;
            w.write_u16::<BigEndian>(proto)?;
        }
        Frame::DiscReq { dest_port, src_port } => {
            write_header(&mut w, Opcode::DiscReq, dest_port, src_port)?;
        }
        Frame::PingReq { dest_port, src_port } => {
            write_header(&mut w, Opcode::PingReq, dest_port, src_port)?;
        }
        Frame::PingAck { dest_port, src_port } => {
            write_header(&mut w, Opcode::PingAck, dest_port, src_port)?;
        }
        Frame::Error {
            dest_port,
            src_port,
            code,
            ref message,
        } => {
            write_header(&mut w, Opcode::Error, dest_port, src_port)?;
            w.write_u8(code)?;
            w.write_all(message.as_bytes())?;
        }
    }
    Ok(())
}

/// Peeks the raw opcode byte without fully decoding, so the dispatcher can
/// tell a malformed `data`/`data-more` frame apart from any other malformed
/// frame (spec.md §4.3's "except length-invalid data frames on an
/// established pipe" carve-out is a dispatch-time decision, not a codec
/// one, since it depends on whether a pipe exists for the address).
pub fn peek_opcode(bytes: &[u8]) -> Option<Opcode> {
    bytes.first().copied().and_then(Opcode::from_u8)
}

/// Parses just the fixed header fields (opcode, dest/src ports) without
/// validating or decoding the opcode-specific body. Lets the dispatcher
/// recover addressing for a frame whose body failed full [`decode`] (spec.md
/// §4.3's length-invalid `data`/`data-more` carve-out needs the address pair
/// to find the pipe to close).
pub fn peek_header(bytes: &[u8]) -> Option<(Opcode, u32, u32)> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let mut cursor = Cursor::new(bytes);
    let opcode = Opcode::from_u8(cursor.read_u8().ok()?)?;
    let _flags = cursor.read_u8().ok()?;
    let _version = cursor.read_u16::<BigEndian>().ok()?;
    let _reserved1 = cursor.read_u8().ok()?;
    let dest_port = read_u24(&mut cursor).ok()?;
    let _reserved2 = cursor.read_u8().ok()?;
    let src_port = read_u24(&mut cursor).ok()?;
    Some((opcode, dest_port, src_port))
}

/// Decodes one wire frame out of a virtual-recv payload. `ethertype` is
/// whatever the overlay library reported for the enclosing Ethernet frame.
/// Returns `None` on any validation failure (bad ethertype, short length,
/// wrong version, non-zero reserved bytes, unknown opcode, truncated body) —
/// per spec.md §4.3 these are always silently dropped at the codec layer.
pub fn decode(ethertype: u16, bytes: &[u8]) -> Option<Frame> {
    if ethertype != ETHERTYPE {
        return None;
    }
    if bytes.len() < HEADER_LEN {
        return None;
    }

    let mut cursor = Cursor::new(bytes);
    let opcode_byte = cursor.read_u8().ok()?;
    let opcode = Opcode::from_u8(opcode_byte)?;
    let flags = cursor.read_u8().ok()?;
    if flags != 0 {
        return None;
    }
    let version = cursor.read_u16::<BigEndian>().ok()?;
    if version != VERSION {
        return None;
    }
    let reserved1 = cursor.read_u8().ok()?;
    if reserved1 != 0 {
        return None;
    }
    let dest_port = read_u24(&mut cursor).ok()?;
    let reserved2 = cursor.read_u8().ok()?;
    if reserved2 != 0 {
        return None;
    }
    let src_port = read_u24(&mut cursor).ok()?;

    let body = &bytes[HEADER_LEN..];

    match opcode {
        Opcode::Data | Opcode::DataMore => {
            let mut bc = Cursor::new(body);
            if bc.remaining_data() < DATA_HEADER_LEN {
                return None;
            }
            let msg_id = bc.read_u16::<BigEndian>().ok()?;
            let frag_size = bc.read_u16::<BigEndian>().ok()?;
            let frag_no = bc.read_u16::<BigEndian>().ok()?;
            let n_frags = bc.read_u16::<BigEndian>().ok()?;
            let payload = body[DATA_HEADER_LEN..].to_vec();
            Some(Frame::Data {
                dest_port,
                src_port,
                more: opcode == Opcode::DataMore,
                msg_id,
                frag_size,
                frag_no,
                n_frags,
                payload,
            })
        }
        Opcode::ConnReq | Opcode::ConnAck => {
            if body.len() < 2 {
                return None;
            }
            let proto = Cursor::new(body).read_u16::<BigEndian>().ok()?;
            Some(if opcode == Opcode::ConnReq {
                Frame::ConnReq {
                    dest_port,
                    src_port,
                    proto,
                }
            } else {
                Frame::ConnAck {
                    dest_port,
                    src_port,
                    proto,
                }
            })
        }
        Opcode::DiscReq => Some(Frame::DiscReq { dest_port, src_port }),
        Opcode::PingReq => Some(Frame::PingReq { dest_port, src_port }),
        Opcode::PingAck => Some(Frame::PingAck { dest_port, src_port }),
        Opcode::Error => {
            if body.is_empty() {
                return None;
            }
            let code = body[0];
            let message = String::from_utf8_lossy(&body[1..]).into_owned();
            Some(Frame::Error {
                dest_port,
                src_port,
                code,
                message,
            })
        }
    }
}

/// Encodes `frame` into a buffer of at most `max_len` bytes — the physical
/// MTU a frame rides inside (spec.md §4.5). Returns `None` if the encoded
/// frame would not fit, instead of silently truncating it on the wire.
pub fn encode_bounded(frame: &Frame, max_len: usize) -> Option<Vec<u8>> {
    let mut storage = vec![0u8; max_len];
    let used = {
        let mut cursor = Cursor::new(&mut storage[..]);
        encode_into(frame, &mut cursor).ok()?;
        max_len - cursor.free_capacity()
    };
    storage.truncate(used);
    Some(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let bytes = encode(&frame);
        let decoded = decode(ETHERTYPE, &bytes).expect("decode should succeed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrips_every_opcode() {
        roundtrip(Frame::Data {
            dest_port: 0x800001,
            src_port: 0x000002,
            more: true,
            msg_id: 7,
            frag_size: 1480,
            frag_no: 0,
            n_frags: 3,
            payload: vec![0xAB; 1480],
        });
        roundtrip(Frame::Data {
            dest_port: 0x800001,
            src_port: 0x000002,
            more: false,
            msg_id: 7,
            frag_size: 1480,
            frag_no: 2,
            n_frags: 3,
            payload: vec![0xAB; 1136],
        });
        roundtrip(Frame::ConnReq {
            dest_port: 7,
            src_port: 0x800010,
            proto: 42,
        });
        roundtrip(Frame::ConnAck {
            dest_port: 0x800010,
            src_port: 7,
            proto: 42,
        });
        roundtrip(Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        });
        roundtrip(Frame::PingReq {
            dest_port: 1,
            src_port: 2,
        });
        roundtrip(Frame::PingAck {
            dest_port: 2,
            src_port: 1,
        });
        roundtrip(Frame::Error {
            dest_port: 1,
            src_port: 2,
            code: 1,
            message: "connection refused: no listener".to_string(),
        });
    }

    #[test]
    fn rejects_wrong_ethertype() {
        let bytes = encode(&Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        });
        assert!(decode(0x0800, &bytes).is_none());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = encode(&Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        });
        bytes[2] = 0x00;
        bytes[3] = 0x02;
        assert!(decode(ETHERTYPE, &bytes).is_none());
    }

    #[test]
    fn rejects_nonzero_reserved_bytes() {
        let mut bytes = encode(&Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        });
        bytes[4] = 1;
        assert!(decode(ETHERTYPE, &bytes).is_none());
    }

    #[test]
    fn rejects_short_data_body() {
        let mut bytes = encode(&Frame::Data {
            dest_port: 1,
            src_port: 2,
            more: false,
            msg_id: 1,
            frag_size: 10,
            frag_no: 0,
            n_frags: 1,
            payload: vec![0; 4],
        });
        bytes.truncate(HEADER_LEN + 3);
        assert!(decode(ETHERTYPE, &bytes).is_none());
        assert_eq!(peek_opcode(&bytes), Some(Opcode::Data));
    }

    #[test]
    fn encode_bounded_fits_within_mtu() {
        let frame = Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        };
        let bytes = encode_bounded(&frame, 1500).expect("small frame must fit");
        assert_eq!(bytes, encode(&frame));
    }

    #[test]
    fn encode_bounded_rejects_frame_larger_than_buffer() {
        let frame = Frame::Data {
            dest_port: 1,
            src_port: 2,
            more: false,
            msg_id: 1,
            frag_size: 1000,
            frag_no: 0,
            n_frags: 1,
            payload: vec![0xAB; 1000],
        };
        assert!(encode_bounded(&frame, 64).is_none());
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = encode(&Frame::DiscReq {
            dest_port: 1,
            src_port: 2,
        });
        bytes[0] = 0x7f;
        assert!(decode(ETHERTYPE, &bytes).is_none());
        assert_eq!(peek_opcode(&bytes), None);
    }
}
