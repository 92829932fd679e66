//! Packet buffers.
//!
//! [`Buf`] owns a single packet, header included. Constructors leave the
//! size field zero; [`Buf::finalize`] fills it in just before the packet is
//! handed to the guest, so a buffer may be shrunk freely until then.

use std::fmt;

use bytes::BytesMut;

use crate::code::{Code, Domain};

pub const ALIGNMENT: usize = 8;
pub const HEADER_SIZE: usize = 8;
pub const MAX_PACKET_SIZE: usize = 65536;

const OFFSET_SIZE: usize = 0;
const OFFSET_CODE: usize = 4;
const OFFSET_DOMAIN: usize = 6;
const OFFSET_INDEX: usize = 7;

pub const FLOW_HEADER_SIZE: usize = HEADER_SIZE;
pub const FLOW_ENTRY_SIZE: usize = 8;

const OFFSET_DATA_ID: usize = HEADER_SIZE;
const OFFSET_DATA_NOTE: usize = HEADER_SIZE + 4;
pub const DATA_HEADER_SIZE: usize = HEADER_SIZE + 8;

/// Round `n` up to the packet alignment.
pub const fn align(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// One flow entry: a stream id and a credit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub id: i32,
    pub value: i32,
}

impl Flow {
    pub fn is_increment(&self) -> bool {
        self.value > 0
    }

    pub fn is_eof(&self) -> bool {
        self.value == 0
    }
}

/// A packet, header included.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Buf(BytesMut);

impl Buf {
    /// Allocate a zeroed packet of `packet_size` bytes with code and domain set.
    pub fn make(code: Code, domain: Domain, packet_size: usize) -> Self {
        let mut b = BytesMut::zeroed(packet_size.max(HEADER_SIZE));
        b[OFFSET_CODE..OFFSET_CODE + 2].copy_from_slice(&code.get().to_le_bytes());
        b[OFFSET_DOMAIN] = domain.bits();
        Self(b)
    }

    pub fn make_call(code: Code, content_size: usize) -> Self {
        Self::make(code, Domain::CALL, HEADER_SIZE + content_size)
    }

    pub fn make_info(code: Code, content_size: usize) -> Self {
        Self::make(code, Domain::INFO, HEADER_SIZE + content_size)
    }

    /// Flow packet with room for `count` zeroed entries.
    pub fn make_flows(code: Code, count: usize) -> Self {
        Self::make(code, Domain::FLOW, FLOW_HEADER_SIZE + count * FLOW_ENTRY_SIZE)
    }

    pub fn make_flow(code: Code, id: i32, value: i32) -> Self {
        let mut b = Self::make_flows(code, 1);
        b.set_flow(0, Flow { id, value });
        b
    }

    /// Flow packet closing the stream's receiving side.
    pub fn make_flow_eof(code: Code, id: i32) -> Self {
        Self::make_flow(code, id, 0)
    }

    /// Data packet with room for `data_size` bytes.
    pub fn make_data(code: Code, id: i32, data_size: usize) -> Self {
        let mut b = Self::make(code, Domain::DATA, DATA_HEADER_SIZE + data_size);
        b.put_i32(OFFSET_DATA_ID, id);
        b
    }

    pub fn make_data_eof(code: Code, id: i32) -> Self {
        Self::make_data(code, id, 0)
    }

    pub fn into_inner(self) -> BytesMut {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length including alignment padding.
    pub fn padded_len(&self) -> usize {
        align(self.0.len())
    }

    /// Value of the size field, which is zero until finalized.
    pub fn size_field(&self) -> u32 {
        self.get_u32(OFFSET_SIZE)
    }

    /// Write the buffer length into the size field.
    pub fn finalize(&mut self) {
        let size = self.0.len() as u32;
        self.0[OFFSET_SIZE..OFFSET_SIZE + 4].copy_from_slice(&size.to_le_bytes());
    }

    pub fn clear_size(&mut self) {
        self.0[OFFSET_SIZE..OFFSET_SIZE + 4].fill(0);
    }

    pub fn code(&self) -> Code {
        Code::new(i16::from_le_bytes([
            self.0[OFFSET_CODE],
            self.0[OFFSET_CODE + 1],
        ]))
    }

    pub fn set_code(&mut self, code: Code) {
        self.0[OFFSET_CODE..OFFSET_CODE + 2].copy_from_slice(&code.get().to_le_bytes());
    }

    /// Raw domain byte, reserved bits included.
    pub fn domain_bits(&self) -> u8 {
        self.0[OFFSET_DOMAIN]
    }

    pub fn domain(&self) -> Domain {
        Domain::from_bits(self.domain_bits())
    }

    pub fn index(&self) -> u8 {
        self.0[OFFSET_INDEX]
    }

    pub fn set_index(&mut self, index: u8) {
        self.0[OFFSET_INDEX] = index;
    }

    /// Everything after the header.
    pub fn content(&self) -> &[u8] {
        &self.0[HEADER_SIZE..]
    }

    pub fn content_mut(&mut self) -> &mut [u8] {
        &mut self.0[HEADER_SIZE..]
    }

    /// Shorten the packet. Never grows it.
    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len.max(HEADER_SIZE));
    }

    /// Split the buffer after `prefix_len` bytes.
    ///
    /// The first part is the packet proper. The remainder, if it can hold at
    /// least `header_size` bytes, becomes a second packet carrying a copy of
    /// the first `header_size` bytes. No packet bytes are copied besides the
    /// header, and both parts keep sharing the original allocation.
    pub fn cut(mut self, header_size: usize, prefix_len: usize) -> (Buf, Option<Buf>) {
        let prefix_len = prefix_len.clamp(header_size.min(self.0.len()), self.0.len());
        let mut tail = self.0.split_off(prefix_len);
        if tail.len() < header_size {
            return (self, None);
        }
        tail[..header_size].copy_from_slice(&self.0[..header_size]);
        (self, Some(Buf(tail)))
    }

    /// `cut` specialised for data packets holding `data_len` bytes.
    pub fn cut_data(self, data_len: usize) -> (Buf, Option<Buf>) {
        self.cut(DATA_HEADER_SIZE, DATA_HEADER_SIZE + data_len)
    }

    pub fn flow_count(&self) -> usize {
        self.0.len().saturating_sub(FLOW_HEADER_SIZE) / FLOW_ENTRY_SIZE
    }

    pub fn flow(&self, i: usize) -> Flow {
        let off = FLOW_HEADER_SIZE + i * FLOW_ENTRY_SIZE;
        Flow {
            id: self.get_i32(off),
            value: self.get_i32(off + 4),
        }
    }

    pub fn set_flow(&mut self, i: usize, flow: Flow) {
        let off = FLOW_HEADER_SIZE + i * FLOW_ENTRY_SIZE;
        self.put_i32(off, flow.id);
        self.put_i32(off + 4, flow.value);
    }

    pub fn flows(&self) -> impl Iterator<Item = Flow> + '_ {
        (0..self.flow_count()).map(move |i| self.flow(i))
    }

    pub fn data_id(&self) -> i32 {
        self.get_i32(OFFSET_DATA_ID)
    }

    pub fn set_data_id(&mut self, id: i32) {
        self.put_i32(OFFSET_DATA_ID, id);
    }

    pub fn data_note(&self) -> i32 {
        self.get_i32(OFFSET_DATA_NOTE)
    }

    pub fn set_data_note(&mut self, note: i32) {
        self.put_i32(OFFSET_DATA_NOTE, note);
    }

    pub fn data(&self) -> &[u8] {
        &self.0[DATA_HEADER_SIZE.min(self.0.len())..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = DATA_HEADER_SIZE.min(self.0.len());
        &mut self.0[start..]
    }

    pub fn data_len(&self) -> usize {
        self.0.len().saturating_sub(DATA_HEADER_SIZE)
    }

    fn get_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn get_i32(&self, off: usize) -> i32 {
        self.get_u32(off) as i32
    }

    fn put_i32(&mut self, off: usize, value: i32) {
        self.0[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl From<BytesMut> for Buf {
    fn from(b: BytesMut) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for Buf {
    fn from(v: Vec<u8>) -> Self {
        Self(BytesMut::from(&v[..]))
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() < HEADER_SIZE {
            return write!(f, "<short packet of {} bytes>", self.0.len());
        }
        write!(
            f,
            "{} {} packet: size={}",
            self.code(),
            self.domain(),
            self.0.len()
        )?;
        match self.domain() {
            Domain::CALL => write!(f, " index={}", self.index()),
            Domain::FLOW => {
                for flow in self.flows() {
                    write!(f, " [{}:{}]", flow.id, flow.value)?;
                }
                Ok(())
            }
            Domain::DATA if self.0.len() >= DATA_HEADER_SIZE => write!(
                f,
                " id={} note={} len={}",
                self.data_id(),
                self.data_note(),
                self.data_len()
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 8);
        assert_eq!(align(8), 8);
        assert_eq!(align(17), 24);
    }

    #[test]
    fn make_sets_header() {
        let p = Buf::make_call(Code::new(3), 5);
        assert_eq!(p.len(), 13);
        assert_eq!(p.code(), Code::new(3));
        assert_eq!(p.domain(), Domain::CALL);
        assert_eq!(p.size_field(), 0);
        assert_eq!(p.content().len(), 5);
        assert_eq!(p.padded_len(), 16);
    }

    #[test]
    fn finalize_writes_size() {
        let mut p = Buf::make_info(Code::new(0), 3);
        p.finalize();
        assert_eq!(p.size_field(), 11);
        assert_eq!(&p.as_bytes()[..4], &[11, 0, 0, 0]);
        p.clear_size();
        assert_eq!(p.size_field(), 0);
    }

    #[test]
    fn services_code_encoding() {
        let p = Buf::make_call(Code::SERVICES, 2);
        assert_eq!(&p.as_bytes()[4..6], &[0xff, 0xff]);
        assert_eq!(p.code(), Code::SERVICES);
    }

    #[test]
    fn flow_entries() {
        let mut p = Buf::make_flows(Code::new(1), 2);
        p.set_flow(0, Flow { id: 4, value: 100 });
        p.set_flow(1, Flow { id: 5, value: 0 });
        assert_eq!(p.flow_count(), 2);
        let flows: Vec<Flow> = p.flows().collect();
        assert_eq!(flows[0], Flow { id: 4, value: 100 });
        assert!(flows[0].is_increment());
        assert!(flows[1].is_eof());
    }

    #[test]
    fn make_flow_single_entry() {
        let p = Buf::make_flow(Code::new(2), 7, 8);
        assert_eq!(p.len(), 16);
        assert_eq!(p.domain(), Domain::FLOW);
        assert_eq!(p.flow(0), Flow { id: 7, value: 8 });
    }

    #[test]
    fn data_accessors() {
        let mut p = Buf::make_data(Code::new(0), 9, 4);
        p.data_mut().copy_from_slice(b"ABCD");
        p.set_data_note(3);
        assert_eq!(p.data_id(), 9);
        assert_eq!(p.data_note(), 3);
        assert_eq!(p.data(), b"ABCD");
        assert_eq!(p.data_len(), 4);
    }

    #[test]
    fn data_eof_is_header_only() {
        let p = Buf::make_data_eof(Code::new(0), 1);
        assert_eq!(p.len(), DATA_HEADER_SIZE);
        assert_eq!(p.data_len(), 0);
        assert!(p.data().is_empty());
    }

    #[test]
    fn cut_shares_header() {
        let mut p = Buf::make_data(Code::new(1), 2, 64);
        p.data_mut()[..3].copy_from_slice(b"abc");
        let (head, tail) = p.cut_data(3);
        assert_eq!(head.data(), b"abc");
        assert_eq!(head.len(), DATA_HEADER_SIZE + 3);

        let tail = tail.unwrap();
        assert_eq!(tail.code(), Code::new(1));
        assert_eq!(tail.domain(), Domain::DATA);
        assert_eq!(tail.data_id(), 2);
        assert_eq!(tail.data_len(), 64 - 3 - DATA_HEADER_SIZE);
    }

    #[test]
    fn cut_without_room_for_header() {
        let p = Buf::make_data(Code::new(1), 2, 8);
        let (head, tail) = p.cut_data(4);
        assert_eq!(head.data_len(), 4);
        assert!(tail.is_none());
    }

    #[test]
    fn truncate_keeps_header() {
        let mut p = Buf::make_call(Code::new(0), 10);
        p.truncate(2);
        assert_eq!(p.len(), HEADER_SIZE);
    }

    #[test]
    fn from_vec_roundtrip_header() {
        let mut p = Buf::make_call(Code::new(4), 1);
        p.set_index(9);
        p.finalize();
        let q = Buf::from(p.as_bytes().to_vec());
        assert_eq!(q, p);
        assert_eq!(q.index(), 9);
    }

    #[test]
    fn display_formats() {
        let p = Buf::make_flow(Code::new(0), 1, 8);
        assert_eq!(p.to_string(), "service[0] flow packet: size=16 [1:8]");
        let p = Buf::make_data(Code::new(2), 3, 1);
        assert_eq!(p.to_string(), "service[2] data packet: size=17 id=3 note=0 len=1");
        let p = Buf::make_call(Code::SERVICES, 0);
        assert_eq!(p.to_string(), "services call packet: size=8 index=0");
    }
}
