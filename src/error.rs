//! # Error Types
//!
//! The single error taxonomy shared by the whole execution core.
//!
//! ## Design
//!
//! Every failure here is a fail-fast condition: none of these are recovered
//! locally. They propagate through `?` up to the driving simulator loop,
//! which is expected to print the failing work-item's backtrace and abort
//! the kernel dispatch. There is no partial-failure isolation between
//! work-items; one illegal operation aborts the whole dispatch so that
//! guest-program and loader bugs surface immediately.

use thiserror::Error;

use crate::code::{Opcode, Segment};

/// Errors raised by the kernel-execution core.
#[derive(Debug, Error)]
pub enum EmuError {
    /// An arena allocator could not satisfy a request.
    #[error("out of space: cannot allocate {size} bytes (alignment {alignment})")]
    OutOfSpace {
        /// Requested size in bytes.
        size: u32,
        /// Requested alignment in bytes.
        alignment: u32,
    },

    /// A free of an address that is not a live allocation.
    #[error("invalid free of address {address:#x}: not a live allocation")]
    InvalidFree {
        /// The address passed to the failing free call.
        address: u32,
    },

    /// An operation against a segment this core intentionally does not
    /// implement (NONE, FLAT, READONLY, SPILL, or declaring in KERNARG).
    #[error("unsupported segment {segment:?} in {operation}")]
    UnsupportedSegment {
        /// The offending segment.
        segment: Segment,
        /// What was attempted against it.
        operation: &'static str,
    },

    /// A name lookup missed in a variable scope or argument chain.
    #[error("no binding named `{name}` in {scope} scope")]
    MissingBinding {
        /// The name that failed to resolve.
        name: String,
        /// Which scope chain was searched.
        scope: &'static str,
    },

    /// A violation of the argument-scope or call protocol, e.g. opening an
    /// argument scope while one is already open.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Kernel or function resolution failed at dispatch-construction time.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// A register name that the current function's register table does not
    /// know. Callers must treat this as an error, never as a valid offset.
    #[error("unknown register `{0}`")]
    UnknownRegister(String),

    /// An instruction was dispatched whose opcode has no registered handler.
    #[error("opcode {0:?} has no registered handler")]
    UnimplementedOpcode(Opcode),

    /// A guest-memory access outside any backed region.
    #[error("memory fault: {size}-byte access at {address:#x} is out of bounds")]
    MemoryFault {
        /// Flat address of the failing access.
        address: u32,
        /// Access width in bytes.
        size: u32,
    },

    /// An invalid emulator configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EmuError>;
