//! Instance snapshots.
//!
//! Layout:
//!
//! ```text
//! "GATESNAP" version:u8 count:varint
//!   { name_len:varint name buf_len:varint buf } * count
//! pending_len:varint pending
//! ```
//!
//! `pending` holds packets that were queued for the guest but not yet
//! delivered, back to back with their size fields set and padding included.

use gate_packet::{align, Buf, Error, Result, HEADER_SIZE, MAX_PACKET_SIZE};
use gate_packetio::varint;
use gate_service::ServiceSnapshot;

const MAGIC: &[u8; 8] = b"GATESNAP";
const VERSION: u8 = 1;

/// Everything needed to resume a suspended instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSnapshot {
    /// One entry per service code, in code order.
    pub services: Vec<ServiceSnapshot>,
    pub pending: Vec<u8>,
}

impl InstanceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.pending.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + 1 + self.pending.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        varint::put(&mut out, self.services.len() as u32);
        for service in &self.services {
            put_bytes(&mut out, service.name.as_bytes());
            put_bytes(&mut out, &service.buffer);
        }
        put_bytes(&mut out, &self.pending);
        out
    }

    pub fn from_bytes(input: &[u8]) -> Result<Self> {
        let rest = input
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| invalid("bad magic"))?;
        let (&version, rest) = rest.split_first().ok_or_else(|| invalid("no version"))?;
        if version != VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }

        let (count, mut rest) = varint::scan(rest)?;
        let mut services = Vec::new();
        for _ in 0..count {
            let (name, tail) = varint::scan_bytes(rest)?;
            let name = std::str::from_utf8(name)
                .map_err(|_| invalid("service name is not UTF-8"))?;
            let (buffer, tail) = varint::scan_bytes(tail)?;
            services.push(ServiceSnapshot {
                name: name.to_string(),
                buffer: buffer.to_vec(),
            });
            rest = tail;
        }
        let (pending, rest) = varint::scan_bytes(rest)?;
        if !rest.is_empty() {
            return Err(invalid("trailing bytes"));
        }
        Ok(Self {
            services,
            pending: pending.to_vec(),
        })
    }

    /// Append packets to `pending`.
    pub(crate) fn push_pending<'a>(&mut self, packets: impl IntoIterator<Item = &'a Buf>) {
        for p in packets {
            self.pending.extend_from_slice(p.as_bytes());
            self.pending.resize(self.pending.len() + p.padded_len() - p.len(), 0);
        }
    }

    /// Split `pending` back into packets.
    pub(crate) fn pending_packets(&self) -> Result<Vec<Buf>> {
        let mut packets = Vec::new();
        let mut rest = &self.pending[..];
        while !rest.is_empty() {
            if rest.len() < HEADER_SIZE {
                return Err(invalid("truncated pending packet"));
            }
            let size = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) || size > rest.len() {
                return Err(invalid(format!("pending packet size {size}")));
            }
            packets.push(Buf::from(rest[..size].to_vec()));
            rest = &rest[align(size).min(rest.len())..];
        }
        Ok(packets)
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    varint::put(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn invalid(detail: impl Into<String>) -> Error {
    Error::internal("snapshot is invalid", detail)
}
