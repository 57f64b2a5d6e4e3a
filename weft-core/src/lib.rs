//! weft core library
//!
//! Foundational types shared by the weft middleware host: the frozen
//! guest-facing ABI surface (import module name, kind enums, packed
//! 64-bit return encodings), the feature-negotiation bitmask, and the
//! error taxonomy used across the workspace.
//!
//! This crate is deliberately light on dependencies so that both the
//! host bridge and tooling can depend on it without pulling in a
//! WebAssembly runtime or an HTTP stack.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod error;
pub mod features;

pub use abi::{BodyKind, HeaderKind, LogLevel, HTTP_HANDLER_MODULE};
pub use error::{ProtocolViolation, Result, WeftError};
pub use features::Features;
