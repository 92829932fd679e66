//! Packet validation.
//!
//! Everything read from a guest passes through [`validate`] before any
//! service sees it. A failure is a [`Error::BadProgram`], which terminates
//! the instance.

use crate::buf::{
    Buf, DATA_HEADER_SIZE, FLOW_ENTRY_SIZE, FLOW_HEADER_SIZE, HEADER_SIZE, MAX_PACKET_SIZE,
};
use crate::code::{Code, Domain};
use crate::error::{Error, Result};

/// Check a packet received from a guest.
pub fn validate(p: &Buf) -> Result<()> {
    check(p, false).map_err(Error::bad_program)
}

/// Check a packet about to be sent to a guest.
///
/// A failure here is a host bug, so it is reported as an internal error.
pub fn validate_outbound(p: &Buf) -> Result<()> {
    check(p, true).map_err(|msg| Error::internal("service sent an invalid packet", msg))
}

fn check(p: &Buf, outbound: bool) -> std::result::Result<(), String> {
    let size = p.len();
    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(format!("invalid packet size {size}"));
    }
    if p.size_field() as usize != size {
        return Err(format!(
            "packet size field {} does not match length {size}",
            p.size_field()
        ));
    }
    if p.domain_bits() & !0x0f != 0 {
        return Err(format!("reserved domain bits set: {:#04x}", p.domain_bits()));
    }

    let code = p.code();
    if code.get() < Code::SERVICES.get() {
        return Err(format!("invalid service code {}", code.get()));
    }
    let domain = p.domain();
    // Guests may only request; the unsolicited Info listing goes the other way.
    let services_ok = domain == Domain::CALL || (outbound && domain == Domain::INFO);
    if code == Code::SERVICES && !services_ok {
        return Err(format!("services packet in {domain} domain"));
    }

    match domain {
        Domain::CALL | Domain::INFO => Ok(()),
        Domain::FLOW => {
            if (size - FLOW_HEADER_SIZE) % FLOW_ENTRY_SIZE != 0 {
                return Err(format!("flow packet size {size} is misaligned"));
            }
            for flow in p.flows() {
                if flow.id < 0 {
                    return Err(format!("negative stream id {}", flow.id));
                }
                if flow.value < 0 {
                    return Err(format!("flow note {} on stream {}", flow.value, flow.id));
                }
            }
            Ok(())
        }
        Domain::DATA => {
            if size < DATA_HEADER_SIZE {
                return Err(format!("data packet size {size} is too short"));
            }
            if p.data_id() < 0 {
                return Err(format!("negative stream id {}", p.data_id()));
            }
            Ok(())
        }
        other => Err(format!("invalid domain {}", other.bits())),
    }
}
