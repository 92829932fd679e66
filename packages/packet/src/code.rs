//! Service codes and packet domains.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Service code: the position of a service in the instance's service list.
///
/// Negative codes are reserved. Only [`Code::SERVICES`] is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(i16);

impl Code {
    /// Service discovery requests and responses.
    pub const SERVICES: Code = Code(-1);

    pub const fn new(value: i16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i16 {
        self.0
    }

    /// Slot index for ordinary service codes.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Default for Code {
    fn default() -> Self {
        Self(0)
    }
}

impl From<i16> for Code {
    fn from(value: i16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::SERVICES {
            f.write_str("services")
        } else {
            write!(f, "service[{}]", self.0)
        }
    }
}

/// Packet domain, stored in the low four bits of the domain byte.
///
/// Domains are ordered: a service declares the highest domain it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(u8);

impl Domain {
    pub const CALL: Domain = Domain(0);
    pub const INFO: Domain = Domain(1);
    pub const FLOW: Domain = Domain(2);
    pub const DATA: Domain = Domain(3);

    pub(crate) const MASK: u8 = 0x0f;

    /// Interpret the domain byte of a packet header.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn is_known(self) -> bool {
        self <= Self::DATA
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CALL => f.write_str("call"),
            Self::INFO => f.write_str("info"),
            Self::FLOW => f.write_str("flow"),
            Self::DATA => f.write_str("data"),
            Self(n) => write!(f, "<invalid domain {n}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_display() {
        assert_eq!(Code::SERVICES.to_string(), "services");
        assert_eq!(Code::new(12).to_string(), "service[12]");
    }

    #[test]
    fn code_index() {
        assert_eq!(Code::new(3).index(), Some(3));
        assert_eq!(Code::SERVICES.index(), None);
    }

    #[test]
    fn domain_display() {
        assert_eq!(Domain::CALL.to_string(), "call");
        assert_eq!(Domain::DATA.to_string(), "data");
        assert_eq!(Domain::from_bits(7).to_string(), "<invalid domain 7>");
    }

    #[test]
    fn domain_ignores_reserved_bits() {
        assert_eq!(Domain::from_bits(0x32), Domain::FLOW);
    }

    #[test]
    fn domain_order() {
        assert!(Domain::CALL < Domain::INFO);
        assert!(Domain::FLOW < Domain::DATA);
        assert!(Domain::DATA.is_known());
        assert!(!Domain::from_bits(4).is_known());
    }

    #[test]
    fn code_serde_is_transparent() {
        let json = serde_json::to_string(&Code::new(5)).unwrap();
        assert_eq!(json, "5");
        let code: Code = serde_json::from_str("-1").unwrap();
        assert_eq!(code, Code::SERVICES);
    }
}
