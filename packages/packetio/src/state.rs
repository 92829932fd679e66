//! Suspended stream state and its byte encoding.
//!
//! Layout of a marshaled stream:
//!
//! ```text
//! stream flags          u8      0x01 = EOF not yet sent to the guest
//! read flags            u8      0x01 = host reader open, 0x02 = guest subscribing
//! read subscribed       varint  outstanding credit
//! read buffer           varint length + bytes of the unsent data packet
//! write flags           u8      0x01 = host writer open, 0x02 = guest sending
//! write subscribed      varint  credit granted but not yet used
//! write buffer          varint length + bytes not yet written to the host
//! ```

use gate_packet::{Buf, Domain, Result, ServiceConfig, DATA_HEADER_SIZE};

use crate::varint::{self, invalid};

const FLAG_SENDING: u8 = 0x1;
const FLAG_READ_WRITING: u8 = 0x1;
const FLAG_SEND_RECEIVING: u8 = 0x2;
const FLAG_WRITE_WRITING: u8 = 0x1;
const FLAG_RECV_RECEIVING: u8 = 0x2;

/// Host-to-guest direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    /// The host reader has not reached its end.
    pub reading: bool,
    /// The guest may still grant credit.
    pub subscribing: bool,
    /// Credit granted by the guest and not yet used.
    pub subscribed: u32,
    /// Data packet read from the host but not yet delivered, size field zero.
    pub pending: Option<Buf>,
}

impl Default for ReadState {
    fn default() -> Self {
        Self {
            reading: true,
            subscribing: true,
            subscribed: 0,
            pending: None,
        }
    }
}

/// Guest-to-host direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteState {
    /// The host writer is open, or its closing has not been acknowledged.
    pub writing: bool,
    /// The guest has not sent EOF.
    pub receiving: bool,
    /// Credit granted to the guest beyond what was written to the host.
    pub subscribed: u32,
    /// Bytes received from the guest but not yet written to the host.
    pub buffer: Vec<u8>,
}

impl Default for WriteState {
    fn default() -> Self {
        Self {
            writing: true,
            receiving: true,
            subscribed: 0,
            buffer: Vec::new(),
        }
    }
}

/// State of a whole stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    /// The guest has not been sent a data EOF yet.
    pub sending: bool,
    pub read: ReadState,
    pub write: WriteState,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            sending: true,
            read: ReadState::default(),
            write: WriteState::default(),
        }
    }
}

impl StreamState {
    /// Whether anything remains to be done in either direction.
    pub fn is_live(&self) -> bool {
        self.sending
            || self.read.subscribing
            || self.read.pending.is_some()
            || self.write.receiving
            || self.write.writing
            || !self.write.buffer.is_empty()
    }

    pub fn marshaled_size(&self) -> usize {
        let pending = self.read.pending.as_ref().map_or(0, Buf::len);
        3 + varint::len(self.read.subscribed)
            + varint::len(pending as u32)
            + pending
            + varint::len(self.write.subscribed)
            + varint::len(self.write.buffer.len() as u32)
            + self.write.buffer.len()
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.reserve(self.marshaled_size());

        out.push(if self.sending { FLAG_SENDING } else { 0 });

        let mut flags = 0;
        if self.read.reading {
            flags |= FLAG_READ_WRITING;
        }
        if self.read.subscribing {
            flags |= FLAG_SEND_RECEIVING;
        }
        out.push(flags);
        varint::put(out, self.read.subscribed);
        match &self.read.pending {
            Some(p) => {
                varint::put(out, p.len() as u32);
                let start = out.len();
                out.extend_from_slice(p.as_bytes());
                out[start..start + 4].fill(0);
            }
            None => varint::put(out, 0),
        }

        let mut flags = 0;
        if self.write.writing {
            flags |= FLAG_WRITE_WRITING;
        }
        if self.write.receiving {
            flags |= FLAG_RECV_RECEIVING;
        }
        out.push(flags);
        varint::put(out, self.write.subscribed);
        varint::put(out, self.write.buffer.len() as u32);
        out.extend_from_slice(&self.write.buffer);
    }

    /// Decode a stream from the front of `input`.
    ///
    /// `config` is the owning service's configuration and `capacity` the ring
    /// capacity the restored write half will get.
    pub fn unmarshal<'a>(
        input: &'a [u8],
        config: &ServiceConfig,
        capacity: usize,
    ) -> Result<(StreamState, &'a [u8])> {
        let (&flags, rest) = input
            .split_first()
            .ok_or_else(|| invalid("stream flags missing"))?;
        let sending = flags & FLAG_SENDING != 0;

        let (&flags, rest) = rest
            .split_first()
            .ok_or_else(|| invalid("read flags missing"))?;
        let (subscribed, rest) = varint::scan_i32(rest)?;
        let (pending, rest) = varint::scan_bytes(rest)?;
        let pending = if pending.is_empty() {
            None
        } else {
            Some(restore_pending(pending, config)?)
        };
        let read = ReadState {
            reading: flags & FLAG_READ_WRITING != 0,
            subscribing: flags & FLAG_SEND_RECEIVING != 0,
            subscribed: subscribed as u32,
            pending,
        };

        let (&flags, rest) = rest
            .split_first()
            .ok_or_else(|| invalid("write flags missing"))?;
        let (subscribed, rest) = varint::scan(rest)?;
        let (buffer, rest) = varint::scan_bytes(rest)?;
        if subscribed as usize > capacity {
            return Err(invalid("write subscription exceeds buffer size"));
        }
        if buffer.len() > capacity {
            return Err(invalid("write buffer exceeds buffer size"));
        }
        let write = WriteState {
            writing: flags & FLAG_WRITE_WRITING != 0,
            receiving: flags & FLAG_RECV_RECEIVING != 0,
            subscribed,
            buffer: buffer.to_vec(),
        };

        Ok((
            StreamState {
                sending,
                read,
                write,
            },
            rest,
        ))
    }
}

fn restore_pending(bytes: &[u8], config: &ServiceConfig) -> Result<Buf> {
    if bytes.len() <= DATA_HEADER_SIZE || bytes.len() > config.max_send_size {
        return Err(invalid("pending data packet has invalid size"));
    }
    let mut p = Buf::from(bytes.to_vec());
    if p.domain_bits() != Domain::DATA.bits() {
        return Err(invalid("pending packet is not a data packet"));
    }
    if p.code() != config.code {
        return Err(invalid("pending packet has wrong service code"));
    }
    p.clear_size();
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_packet::Code;

    fn config() -> ServiceConfig {
        ServiceConfig::new(Code::new(2), 1024)
    }

    fn roundtrip(state: &StreamState) -> StreamState {
        let mut out = Vec::new();
        state.marshal(&mut out);
        assert_eq!(out.len(), state.marshaled_size());
        out.extend_from_slice(b"tail");
        let (decoded, rest) = StreamState::unmarshal(&out, &config(), 64).unwrap();
        assert_eq!(rest, b"tail");
        decoded
    }

    #[test]
    fn initial_state_is_live() {
        let state = StreamState::default();
        assert!(state.is_live());
        assert_eq!(roundtrip(&state), state);
    }

    #[test]
    fn finished_state_is_not_live() {
        let state = StreamState {
            sending: false,
            read: ReadState {
                reading: false,
                subscribing: false,
                subscribed: 0,
                pending: None,
            },
            write: WriteState {
                writing: false,
                receiving: false,
                subscribed: 0,
                buffer: Vec::new(),
            },
        };
        assert!(!state.is_live());
    }

    #[test]
    fn pending_packet_size_is_zeroed() {
        let mut p = Buf::make_data(Code::new(2), 5, 3);
        p.data_mut().copy_from_slice(b"xyz");
        p.finalize();

        let state = StreamState {
            read: ReadState {
                subscribed: 7,
                pending: Some(p),
                ..ReadState::default()
            },
            write: WriteState {
                subscribed: 10,
                buffer: b"hello".to_vec(),
                ..WriteState::default()
            },
            ..StreamState::default()
        };

        let mut out = Vec::new();
        state.marshal(&mut out);
        // stream flags, read flags, subscribed, pending length
        assert_eq!(&out[..4], &[0x1, 0x3, 7, 19]);
        assert_eq!(&out[4..8], &[0, 0, 0, 0]);

        let decoded = roundtrip(&state);
        let pending = decoded.read.pending.as_ref().unwrap();
        assert_eq!(pending.size_field(), 0);
        assert_eq!(pending.data(), b"xyz");
        assert_eq!(pending.data_id(), 5);
        assert_eq!(decoded.write.buffer, b"hello");
        assert_eq!(decoded.write.subscribed, 10);
    }

    #[test]
    fn rejects_foreign_pending_packet() {
        let p = Buf::make_data(Code::new(3), 0, 3);
        let state = StreamState {
            read: ReadState {
                pending: Some(p),
                ..ReadState::default()
            },
            ..StreamState::default()
        };
        let mut out = Vec::new();
        state.marshal(&mut out);
        assert!(StreamState::unmarshal(&out, &config(), 64).is_err());
    }

    #[test]
    fn rejects_oversized_write_buffer() {
        let state = StreamState {
            write: WriteState {
                buffer: vec![0; 65],
                ..WriteState::default()
            },
            ..StreamState::default()
        };
        let mut out = Vec::new();
        state.marshal(&mut out);
        assert!(StreamState::unmarshal(&out, &config(), 64).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let mut out = Vec::new();
        StreamState::default().marshal(&mut out);
        out.pop();
        assert!(StreamState::unmarshal(&out, &config(), 64).is_err());
    }
}
