/**
    xenstore-rs provides a Rust based xenstore implementation.
    Copyright (C) 2016 Star Lab Corp.

    This program is free software; you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation; either version 2 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License along
    with this program; if not, see <http://www.gnu.org/licenses/>.
**/

//! The XenStore wire format: a fixed 16 byte little-endian header followed
//! by a payload of at most 4096 bytes. See `xen/include/public/io/xs_wire.h`
//! for the canonical C definition this mirrors.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// XenStore message types.
pub const XS_DEBUG: u32 = 0;
pub const XS_DIRECTORY: u32 = 1;
pub const XS_READ: u32 = 2;
pub const XS_GET_PERMS: u32 = 3;
pub const XS_WATCH: u32 = 4;
pub const XS_UNWATCH: u32 = 5;
pub const XS_TRANSACTION_START: u32 = 6;
pub const XS_TRANSACTION_END: u32 = 7;
pub const XS_INTRODUCE: u32 = 8;
pub const XS_RELEASE: u32 = 9;
pub const XS_GET_DOMAIN_PATH: u32 = 10;
pub const XS_WRITE: u32 = 11;
pub const XS_MKDIR: u32 = 12;
pub const XS_RM: u32 = 13;
pub const XS_SET_PERMS: u32 = 14;
pub const XS_WATCH_EVENT: u32 = 15;
pub const XS_ERROR: u32 = 16;
pub const XS_IS_DOMAIN_INTRODUCED: u32 = 17;
pub const XS_RESUME: u32 = 18;
pub const XS_SET_TARGET: u32 = 19;
pub const XS_RESTRICT: u32 = 128;

/// Returns `true` if `op` is one of the `XS_*` codes above.
pub fn is_valid_op(op: u32) -> bool {
    matches!(
        op,
        XS_DEBUG
            | XS_DIRECTORY
            | XS_READ
            | XS_GET_PERMS
            | XS_WATCH
            | XS_UNWATCH
            | XS_TRANSACTION_START
            | XS_TRANSACTION_END
            | XS_INTRODUCE
            | XS_RELEASE
            | XS_GET_DOMAIN_PATH
            | XS_WRITE
            | XS_MKDIR
            | XS_RM
            | XS_SET_PERMS
            | XS_WATCH_EVENT
            | XS_ERROR
            | XS_IS_DOMAIN_INTRODUCED
            | XS_RESUME
            | XS_SET_TARGET
            | XS_RESTRICT
    )
}

/// Miscellaneous protocol values.
pub const XENSTORE_PAYLOAD_MAX: usize = 4096;
pub const XENSTORE_ABS_PATH_MAX: usize = 3072;
pub const XENSTORE_REL_PATH_MAX: usize = 2048;

pub type ReqId = u32;
pub type TxId = u32;
pub type DomainId = u32;

/// A header is always 16 bytes long.
pub const HEADER_SIZE: usize = 16;

/// The fixed header that prefixes every message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub op: u32,
    pub rq_id: ReqId,
    pub tx_id: TxId,
    pub size: u32,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> io::Result<Header> {
        if bytes.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "expected 16 bytes for a xenstore header",
            ));
        }
        let mut input = io::Cursor::new(bytes);
        let op = input.read_u32::<LittleEndian>()?;
        let rq_id = input.read_u32::<LittleEndian>()?;
        let tx_id = input.read_u32::<LittleEndian>()?;
        let size = input.read_u32::<LittleEndian>()?;
        Ok(Header { op, rq_id, tx_id, size })
    }

    pub fn to_vec(self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(HEADER_SIZE);
        ret.write_u32::<LittleEndian>(self.op).unwrap();
        ret.write_u32::<LittleEndian>(self.rq_id).unwrap();
        ret.write_u32::<LittleEndian>(self.tx_id).unwrap();
        ret.write_u32::<LittleEndian>(self.size).unwrap();
        ret
    }
}

/// A complete message to or from the daemon: header plus payload.
///
/// Construction validates the two invariants that don't require I/O:
/// `op` must be a recognized code and `payload` must fit in one packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub op: u32,
    pub rq_id: ReqId,
    pub tx_id: TxId,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(op: u32, rq_id: ReqId, tx_id: TxId, payload: Vec<u8>) -> Result<Packet> {
        if !is_valid_op(op) {
            return Err(Error::InvalidOperation(op));
        }
        if payload.len() > XENSTORE_PAYLOAD_MAX {
            return Err(Error::InvalidPayload(payload.len()));
        }
        Ok(Packet { op, rq_id, tx_id, payload })
    }

    pub fn header(&self) -> Header {
        Header { op: self.op, rq_id: self.rq_id, tx_id: self.tx_id, size: self.payload.len() as u32 }
    }

    /// Writes this packet's header then payload as two writes, per §4.1.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.header().to_vec())?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    /// Reads exactly one packet: 16 header bytes, then exactly `size`
    /// payload bytes. `size == 0` does not issue a read, since some
    /// transports (the XenBus character device) block on a zero-length
    /// read rather than returning immediately.
    pub fn decode<R: Read>(r: &mut R) -> Result<Packet> {
        let mut header_buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut header_buf)?;
        let header = Header::parse(&header_buf)?;

        if header.size as usize > XENSTORE_PAYLOAD_MAX {
            return Err(Error::InvalidPayload(header.size as usize));
        }
        if !is_valid_op(header.op) {
            return Err(Error::InvalidOperation(header.op));
        }

        let payload = if header.size == 0 {
            Vec::new()
        } else {
            let mut buf = vec![0u8; header.size as usize];
            r.read_exact(&mut buf)?;
            buf
        };

        Ok(Packet { op: header.op, rq_id: header.rq_id, tx_id: header.tx_id, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    impl Arbitrary for Header {
        fn arbitrary(g: &mut Gen) -> Header {
            Header {
                op: u32::arbitrary(g),
                rq_id: u32::arbitrary(g),
                tx_id: u32::arbitrary(g),
                size: u32::arbitrary(g),
            }
        }
    }

    #[test]
    fn header_parse_values() {
        let hdr = vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0];
        let header = Header::parse(&hdr).unwrap();
        assert_eq!(header.op, 1);
        assert_eq!(header.rq_id, 2);
        assert_eq!(header.tx_id, 3);
        assert_eq!(header.size, 4);
    }

    #[test]
    fn header_idempotent() {
        fn prop(hdr: Header) -> bool {
            Header::parse(&hdr.to_vec()).unwrap() == hdr
        }
        quickcheck(prop as fn(Header) -> bool);
    }

    #[test]
    fn header_parse_rejects_short_input() {
        fn prop(bytes: Vec<u8>) -> bool {
            let expected = bytes.len() >= HEADER_SIZE;
            Header::parse(&bytes).is_ok() == expected
        }
        quickcheck(prop as fn(Vec<u8>) -> bool);
    }

    #[test]
    fn packet_round_trip() {
        let packet = Packet::new(XS_WRITE, 7, 0, b"/foo/bar\0baz".to_vec()).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let decoded = Packet::decode(&mut io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn packet_zero_size_payload_is_legal() {
        let packet = Packet::new(XS_TRANSACTION_START, 1, 0, Vec::new()).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = Packet::decode(&mut io::Cursor::new(buf)).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn payload_at_max_size_is_accepted() {
        let payload = vec![b'a'; XENSTORE_PAYLOAD_MAX];
        assert!(Packet::new(XS_WRITE, 1, 0, payload).is_ok());
    }

    #[test]
    fn payload_over_max_size_is_rejected() {
        let payload = vec![b'a'; XENSTORE_PAYLOAD_MAX + 1];
        match Packet::new(XS_WRITE, 1, 0, payload) {
            Err(Error::InvalidPayload(n)) => assert_eq!(n, XENSTORE_PAYLOAD_MAX + 1),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_op_is_rejected() {
        match Packet::new(999, 1, 0, Vec::new()) {
            Err(Error::InvalidOperation(999)) => {}
            other => panic!("expected InvalidOperation(999), got {other:?}"),
        }
    }
}
