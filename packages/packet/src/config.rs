//! Per-instance service configuration.

use serde::{Deserialize, Serialize};

use crate::buf::MAX_PACKET_SIZE;
use crate::code::Code;

/// Configuration handed to a service when an instance of it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Code assigned to the service in this program instance.
    pub code: Code,

    /// Largest packet the service may send to the guest.
    pub max_send_size: usize,
}

impl ServiceConfig {
    pub fn new(code: Code, max_send_size: usize) -> Self {
        Self {
            code,
            max_send_size,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            code: Code::default(),
            max_send_size: MAX_PACKET_SIZE,
        }
    }
}
