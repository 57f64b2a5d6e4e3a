//! Error types for weft.
//!
//! Errors carry stable `Exxx` codes grouped by class: setup failures
//! (E001-E019) abort middleware construction; guest traps (E020-E029)
//! and protocol violations (E030-E039) terminate the in-flight request
//! and poison the guest instance; host failures (E040-E049) originate
//! outside the guest.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, WeftError>;

/// The main error type for weft operations.
#[derive(Error, Debug)]
pub enum WeftError {
    // =========================================================================
    // Setup errors (E001-E019)
    // =========================================================================
    /// Failed to read the guest binary from disk.
    #[error("E001: failed to read guest module at {path}: {cause}")]
    ModuleRead {
        /// Path to the guest binary.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// The guest binary did not compile.
    #[error("E002: failed to compile guest module '{name}': {cause}")]
    ModuleCompile {
        /// Name the guest was registered under.
        name: String,
        /// Compiler diagnostic.
        cause: String,
    },

    /// Instantiation failed (bad imports, start trap, resource limits).
    #[error("E003: failed to instantiate guest '{name}': {cause}")]
    Instantiate {
        /// Name the guest was registered under.
        name: String,
        /// Reason for the failure.
        cause: String,
    },

    /// The guest is missing a required export.
    #[error("E004: guest '{name}' is missing required export '{export}'")]
    MissingExport {
        /// Name the guest was registered under.
        name: String,
        /// The export that was expected.
        export: &'static str,
    },

    /// The guest's one-shot initialization entry point trapped.
    #[error("E005: guest '{name}' initialization failed: {cause}")]
    GuestInit {
        /// Name the guest was registered under.
        name: String,
        /// Reason for the failure.
        cause: String,
    },

    /// A host function could not be registered with the linker.
    #[error("E006: failed to register host function '{function}': {cause}")]
    HostFunction {
        /// The import that failed to register.
        function: &'static str,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Guest traps (E020-E029)
    // =========================================================================
    /// The guest trapped during a handler invocation.
    ///
    /// The instance that produced this error is poisoned and must not be
    /// reused.
    #[error("E020: guest trapped in '{entry}': {cause}")]
    GuestTrap {
        /// The entry point that was executing.
        entry: &'static str,
        /// Trap description from the runtime.
        cause: String,
    },

    /// A guest invocation exceeded its deadline and was interrupted.
    #[error("E021: guest invocation '{entry}' exceeded its deadline")]
    GuestTimeout {
        /// The entry point that was executing.
        entry: &'static str,
    },

    // =========================================================================
    // Protocol errors (E030-E039)
    // =========================================================================
    /// The guest violated an ABI precondition and was trapped by the host.
    #[error("E030: protocol violation in '{entry}': {violation}")]
    Protocol {
        /// The entry point that was executing.
        entry: &'static str,
        /// The violated precondition.
        #[source]
        violation: ProtocolViolation,
    },

    // =========================================================================
    // Host errors (E040-E049)
    // =========================================================================
    /// The downstream handler failed.
    #[error("E040: downstream handler failed: {cause}")]
    Downstream {
        /// Reason for the failure.
        cause: String,
    },

    /// A body could not be read from the wire.
    #[error("E041: failed to read {direction} body: {cause}")]
    BodyRead {
        /// Which body was being read.
        direction: &'static str,
        /// Reason for the failure.
        cause: String,
    },

    /// The guest rewrote the request URI into something unparseable.
    #[error("E042: guest produced invalid uri '{uri}': {cause}")]
    InvalidUri {
        /// The rejected URI bytes.
        uri: String,
        /// Parser diagnostic.
        cause: String,
    },
}

/// An ABI precondition violated by the guest.
///
/// Raised inside host-function callbacks, where the runtime converts it
/// into a trap; the host never silently repairs a guest error. At the
/// invocation boundary these are wrapped into [`WeftError::Protocol`].
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    /// A guest-supplied offset/length pair fell outside linear memory.
    #[error("memory access out of bounds: offset {offset}, len {len}, memory size {memory_len}")]
    OutOfBounds {
        /// Guest-supplied offset.
        offset: u64,
        /// Guest-supplied length.
        len: u64,
        /// Current size of the guest memory.
        memory_len: u64,
    },

    /// A header function was called with `name_len == 0`.
    #[error("empty header name")]
    EmptyHeaderName,

    /// The header name bytes are not a valid HTTP header name.
    #[error("invalid header name '{name}'")]
    InvalidHeaderName {
        /// The rejected name (lossy UTF-8).
        name: String,
    },

    /// The header value bytes are not a valid HTTP header value.
    #[error("invalid header value for '{name}'")]
    InvalidHeaderValue {
        /// The header the value was destined for.
        name: String,
    },

    /// An unknown header-kind discriminant.
    #[error("unknown header kind {0}")]
    UnknownHeaderKind(i32),

    /// An unknown body-kind discriminant.
    #[error("unknown body kind {0}")]
    UnknownBodyKind(i32),

    /// An operation that is not legal in the current phase.
    #[error("'{call}' is not valid during the {phase} phase")]
    PhaseViolation {
        /// The ABI call.
        call: &'static str,
        /// The phase it was attempted in.
        phase: &'static str,
    },

    /// An operation that requires a feature the guest did not negotiate.
    #[error("'{call}' requires the {feature} feature")]
    FeatureRequired {
        /// The ABI call.
        call: &'static str,
        /// The missing feature.
        feature: &'static str,
    },

    /// A request-scoped call arrived while no request was in flight.
    #[error("'{call}' requires an in-flight request")]
    NoActiveRequest {
        /// The ABI call.
        call: &'static str,
    },

    /// Guest bytes that must be UTF-8 were not.
    #[error("'{call}' received invalid UTF-8")]
    InvalidUtf8 {
        /// The ABI call.
        call: &'static str,
    },

    /// `set_uri` received bytes that do not parse as a path and query.
    #[error("invalid uri '{uri}'")]
    InvalidUri {
        /// The rejected URI (lossy UTF-8).
        uri: String,
    },

    /// `set_status_code` received a value outside the valid range.
    #[error("invalid status code {0}")]
    InvalidStatusCode(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let err = WeftError::MissingExport {
            name: "guest".to_string(),
            export: "handle_request",
        };
        assert!(err.to_string().starts_with("E004:"));

        let err = WeftError::GuestTrap {
            entry: "handle_request",
            cause: "unreachable".to_string(),
        };
        assert!(err.to_string().starts_with("E020:"));

        let err = WeftError::Protocol {
            entry: "handle_response",
            violation: ProtocolViolation::EmptyHeaderName,
        };
        assert!(err.to_string().starts_with("E030:"));
        assert!(err.to_string().contains("empty header name"));
    }

    #[test]
    fn violation_messages_carry_context() {
        let v = ProtocolViolation::OutOfBounds {
            offset: 70_000,
            len: 16,
            memory_len: 65_536,
        };
        let msg = v.to_string();
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));

        let v = ProtocolViolation::FeatureRequired {
            call: "read_body",
            feature: "buffer-response",
        };
        assert!(v.to_string().contains("buffer-response"));
    }
}
