//! The guest-facing ABI surface.
//!
//! Everything in this module is part of the frozen contract between the
//! host and its guests: import module names, kind discriminants, log
//! levels, and the packed 64-bit return encodings. Changing any value
//! here is a wire-format break for every compiled guest.

/// Import module under which all host functions are exposed to the guest.
pub const HTTP_HANDLER_MODULE: &str = "http_handler";

/// Selects which header collection an ABI call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// Request headers.
    Request,
    /// Response headers.
    Response,
    /// Request trailers.
    RequestTrailers,
    /// Response trailers.
    ResponseTrailers,
}

impl HeaderKind {
    /// Decode a raw discriminant from the guest.
    ///
    /// Unknown values return `None`; the caller is expected to trap the
    /// guest rather than guess.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::RequestTrailers),
            3 => Some(Self::ResponseTrailers),
            _ => None,
        }
    }

    /// Whether this kind addresses a trailer collection.
    pub fn is_trailers(self) -> bool {
        matches!(self, Self::RequestTrailers | Self::ResponseTrailers)
    }

    /// Diagnostic name for log and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::RequestTrailers => "request-trailers",
            Self::ResponseTrailers => "response-trailers",
        }
    }
}

/// Selects which body an ABI call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyKind {
    /// The request body.
    Request,
    /// The response body.
    Response,
}

impl BodyKind {
    /// Decode a raw discriminant from the guest.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }

    /// Diagnostic name for log and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// Log level passed by the guest to `log` and `log_enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Informational messages.
    Info,
    /// Warnings.
    Warn,
    /// Errors.
    Error,
    /// Logging disabled; `log` calls at this level are dropped.
    None,
}

impl LogLevel {
    /// Decode a raw level from the guest.
    ///
    /// Values below `DEBUG` clamp to `Debug`; values above `ERROR`
    /// behave as `None`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=-1 => Self::Debug,
            0 => Self::Info,
            1 => Self::Warn,
            2 => Self::Error,
            _ => Self::None,
        }
    }

    /// The wire value for this level.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Debug => -1,
            Self::Info => 0,
            Self::Warn => 1,
            Self::Error => 2,
            Self::None => 3,
        }
    }
}

/// Encode a null-terminated-list result: `(count << 32) | byte_count`.
///
/// `byte_count` is the total byte length of all items plus one NUL
/// terminator per item.
#[inline]
pub fn pack_list(count: u32, byte_count: u32) -> u64 {
    (u64::from(count) << 32) | u64::from(byte_count)
}

/// Encode a body-read result: bit 32 is the end-of-stream flag, the low
/// 32 bits are the number of bytes written by this call.
#[inline]
pub fn pack_body(eof: bool, len: u32) -> u64 {
    (u64::from(eof) << 32) | u64::from(len)
}

/// Split the `ctx_next` value returned by `handle_request`.
///
/// The high 32 bits are an opaque context value that must be handed back
/// to `handle_response` bit-exact; the low bit decides whether the
/// downstream handler runs. Shifts here are on unsigned types on
/// purpose: a sign-extending shift would corrupt context values with
/// the top bit set.
#[inline]
pub fn split_ctx_next(ctx_next: u64) -> (u32, bool) {
    ((ctx_next >> 32) as u32, ctx_next & 1 == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_kind_roundtrip() {
        for raw in 0..4 {
            let kind = HeaderKind::from_raw(raw).unwrap();
            assert_eq!(
                kind.is_trailers(),
                matches!(
                    kind,
                    HeaderKind::RequestTrailers | HeaderKind::ResponseTrailers
                )
            );
        }
        assert_eq!(HeaderKind::from_raw(4), None);
        assert_eq!(HeaderKind::from_raw(-1), None);
    }

    #[test]
    fn body_kind_decoding() {
        assert_eq!(BodyKind::from_raw(0), Some(BodyKind::Request));
        assert_eq!(BodyKind::from_raw(1), Some(BodyKind::Response));
        assert_eq!(BodyKind::from_raw(2), None);
    }

    #[test]
    fn log_level_clamping() {
        assert_eq!(LogLevel::from_raw(-1), LogLevel::Debug);
        assert_eq!(LogLevel::from_raw(-100), LogLevel::Debug);
        assert_eq!(LogLevel::from_raw(0), LogLevel::Info);
        assert_eq!(LogLevel::from_raw(1), LogLevel::Warn);
        assert_eq!(LogLevel::from_raw(2), LogLevel::Error);
        assert_eq!(LogLevel::from_raw(3), LogLevel::None);
        assert_eq!(LogLevel::from_raw(99), LogLevel::None);
    }

    #[test]
    fn pack_list_layout() {
        let packed = pack_list(3, 27);
        assert_eq!(packed >> 32, 3);
        assert_eq!(packed & 0xFFFF_FFFF, 27);

        // High counts must not bleed into the byte count.
        let packed = pack_list(u32::MAX, u32::MAX);
        assert_eq!(packed >> 32, u64::from(u32::MAX));
        assert_eq!(packed & 0xFFFF_FFFF, u64::from(u32::MAX));
    }

    #[test]
    fn pack_body_layout() {
        assert_eq!(pack_body(false, 0), 0);
        assert_eq!(pack_body(true, 0), 1 << 32);
        assert_eq!(pack_body(true, 17), (1 << 32) | 17);
        assert_eq!(pack_body(false, u32::MAX), u64::from(u32::MAX));
    }

    #[test]
    fn split_ctx_next_preserves_high_bits() {
        // A context with the sign bit set must come back bit-exact.
        let ctx_next = (u64::from(0xDEAD_BEEFu32) << 32) | 1;
        let (ctx, proceed) = split_ctx_next(ctx_next);
        assert_eq!(ctx, 0xDEAD_BEEF);
        assert!(proceed);

        let (ctx, proceed) = split_ctx_next(42 << 32);
        assert_eq!(ctx, 42);
        assert!(!proceed);

        // Bits 1..32 are reserved and ignored by the split.
        let (ctx, proceed) = split_ctx_next(0xFFFF_FFFE);
        assert_eq!(ctx, 0);
        assert!(!proceed);
    }
}
