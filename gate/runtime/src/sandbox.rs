//! The sandbox a guest program runs in.
//!
//! The runtime does not execute WebAssembly itself. A [`Sandbox`] spawns the
//! program and hands back a [`Guest`]: both ends of the packet pipe plus a
//! [`GuestControl`] for suspending, killing and waiting.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::storage::ModuleId;

pub type GuestReader = Box<dyn AsyncRead + Send + Unpin>;
pub type GuestWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the guest's debug output goes.
pub type DebugSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A program to run.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub module: ModuleId,
    pub bytes: Vec<u8>,
}

/// A spawned guest.
pub struct Guest {
    /// Packets from the guest.
    pub reader: GuestReader,
    /// Packets to the guest.
    pub writer: GuestWriter,
    pub control: Arc<dyn GuestControl>,
}

impl fmt::Debug for Guest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guest").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn spawn(&self, image: ProgramImage, debug: Option<DebugSink>) -> Result<Guest>;
}

#[async_trait]
pub trait GuestControl: Send + Sync {
    /// Ask the guest to stop at its next safe point. A suspended guest
    /// closes its end of the pipe and exits with [`TrapId::SUSPENDED`].
    fn suspend(&self);

    /// Terminate the guest. Does not wait.
    fn kill(&self);

    /// Wait for the guest to exit.
    async fn wait(&self) -> ExitInfo;
}

/// Reason a guest stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrapId(u8);

impl TrapId {
    pub const EXIT: TrapId = TrapId(0);
    pub const NO_FUNCTION: TrapId = TrapId(1);
    pub const SUSPENDED: TrapId = TrapId(2);
    pub const UNREACHABLE: TrapId = TrapId(3);
    pub const CALL_STACK_EXHAUSTED: TrapId = TrapId(4);
    pub const MEMORY_ACCESS_OUT_OF_BOUNDS: TrapId = TrapId(5);
    pub const INDIRECT_CALL_INDEX_OUT_OF_BOUNDS: TrapId = TrapId(6);
    pub const INDIRECT_CALL_SIGNATURE_MISMATCH: TrapId = TrapId(7);
    pub const INTEGER_DIVIDE_BY_ZERO: TrapId = TrapId(8);
    pub const INTEGER_OVERFLOW: TrapId = TrapId(9);
    pub const BREAKPOINT: TrapId = TrapId(10);
    pub const ABI_DEFICIENCY: TrapId = TrapId(27);
    pub const ABI_VIOLATION: TrapId = TrapId(28);
    pub const INTERNAL_ERROR: TrapId = TrapId(29);
    pub const KILLED: TrapId = TrapId(30);

    pub const fn new(id: u8) -> Self {
        TrapId(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            TrapId::EXIT => "exit",
            TrapId::NO_FUNCTION => "no_function",
            TrapId::SUSPENDED => "suspended",
            TrapId::UNREACHABLE => "unreachable",
            TrapId::CALL_STACK_EXHAUSTED => "call_stack_exhausted",
            TrapId::MEMORY_ACCESS_OUT_OF_BOUNDS => "memory_access_out_of_bounds",
            TrapId::INDIRECT_CALL_INDEX_OUT_OF_BOUNDS => "indirect_call_index_out_of_bounds",
            TrapId::INDIRECT_CALL_SIGNATURE_MISMATCH => "indirect_call_signature_mismatch",
            TrapId::INTEGER_DIVIDE_BY_ZERO => "integer_divide_by_zero",
            TrapId::INTEGER_OVERFLOW => "integer_overflow",
            TrapId::BREAKPOINT => "breakpoint",
            TrapId::ABI_DEFICIENCY => "abi_deficiency",
            TrapId::ABI_VIOLATION => "abi_violation",
            TrapId::INTERNAL_ERROR => "internal_error",
            TrapId::KILLED => "killed",
            _ => return None,
        })
    }
}

impl fmt::Display for TrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "trap {}", self.0),
        }
    }
}

/// How a guest process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    Exited(u32),
    Trapped(TrapId),
    Signaled,
}
