//! Service discovery packets.
//!
//! A discovery request is a Call packet with code [`Code::SERVICES`]. Its
//! content is a little-endian `u16` name count followed by that many names,
//! each prefixed with a one-byte length.
//!
//! The response (a Call reply, or the unsolicited Info packet sent when an
//! instance starts) carries a `u16` count followed by one state byte per
//! service slot, in code order.

use crate::buf::{Buf, HEADER_SIZE};
use crate::code::{Code, Domain};
use crate::error::{Error, Result};

/// Upper bound on the number of services one instance may discover.
pub const MAX_SERVICES: usize = 256;

const OFFSET_COUNT: usize = HEADER_SIZE;
const SERVICES_HEADER_SIZE: usize = HEADER_SIZE + 2;

/// Service state as reported to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceState(u8);

impl ServiceState {
    const AVAILABLE: u8 = 0x1;

    pub fn available() -> Self {
        Self(Self::AVAILABLE)
    }

    pub fn unavailable() -> Self {
        Self(0)
    }

    pub fn set_available(&mut self) {
        self.0 |= Self::AVAILABLE;
    }

    pub fn is_available(&self) -> bool {
        self.0 & Self::AVAILABLE != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Parse the names in a discovery request.
///
/// `current` is the number of services already discovered; names beyond
/// [`MAX_SERVICES`] are ignored.
pub fn parse_services_request(p: &Buf, current: usize) -> Result<Vec<String>> {
    if p.len() < SERVICES_HEADER_SIZE {
        return Err(Error::bad_program("services request packet is too short"));
    }
    let content = p.as_bytes();
    let count = u16::from_le_bytes([content[OFFSET_COUNT], content[OFFSET_COUNT + 1]]) as usize;
    let count = count.min(MAX_SERVICES.saturating_sub(current));

    let mut names = Vec::with_capacity(count);
    let mut rest = &content[SERVICES_HEADER_SIZE..];
    for _ in 0..count {
        let (&len, tail) = rest
            .split_first()
            .ok_or_else(|| Error::bad_program("services request name length is truncated"))?;
        let len = len as usize;
        if len == 0 || tail.len() < len {
            return Err(Error::bad_program("services request name is truncated"));
        }
        let name = std::str::from_utf8(&tail[..len])
            .map_err(|_| Error::bad_program("service name is not valid UTF-8"))?;
        names.push(name.to_string());
        rest = &tail[len..];
    }
    Ok(names)
}

/// Build a discovery request. Used by guests and tests.
pub fn make_services_request<S: AsRef<str>>(names: &[S]) -> Result<Buf> {
    if names.len() > MAX_SERVICES {
        return Err(Error::ResourceLimit("too many service names".into()));
    }
    let mut size = 2;
    for name in names {
        let len = name.as_ref().len();
        if len == 0 || len > u8::MAX as usize {
            return Err(Error::bad_program("invalid service name length"));
        }
        size += 1 + len;
    }

    let mut p = Buf::make_call(Code::SERVICES, size);
    let content = p.content_mut();
    content[..2].copy_from_slice(&(names.len() as u16).to_le_bytes());
    let mut off = 2;
    for name in names {
        let name = name.as_ref().as_bytes();
        content[off] = name.len() as u8;
        content[off + 1..off + 1 + name.len()].copy_from_slice(name);
        off += 1 + name.len();
    }
    Ok(p)
}

/// Build a discovery response listing every slot.
pub fn make_services(domain: Domain, states: &[ServiceState]) -> Buf {
    let mut p = Buf::make(Code::SERVICES, domain, SERVICES_HEADER_SIZE + states.len());
    let content = p.content_mut();
    content[..2].copy_from_slice(&(states.len() as u16).to_le_bytes());
    for (slot, state) in content[2..].iter_mut().zip(states) {
        *slot = state.bits();
    }
    p
}

/// Read the states out of a discovery response.
pub fn parse_services_response(p: &Buf) -> Result<Vec<ServiceState>> {
    if p.len() < SERVICES_HEADER_SIZE {
        return Err(Error::bad_program("services response packet is too short"));
    }
    let content = p.content();
    let count = u16::from_le_bytes([content[0], content[1]]) as usize;
    let states = &content[2..];
    if states.len() < count {
        return Err(Error::bad_program("services response is truncated"));
    }
    Ok(states[..count].iter().map(|&b| ServiceState(b)).collect())
}
