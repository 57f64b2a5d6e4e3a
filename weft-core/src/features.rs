//! Feature negotiation between host and guest.
//!
//! A guest advertises the features it needs through the
//! `enable_features` import, either during initialization (fixing the
//! middleware-wide mask) or during `handle_request` (raising the mask
//! for that request only). Features reshape the middleware: buffering
//! features cause bodies to be materialized so the guest can read and
//! rewrite them.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of negotiated features.
///
/// The mask is monotonic by construction: there is a union operation but
/// no removal. Unknown bits requested by a guest are masked off — the
/// host only reports features it actually honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u32);

impl Features {
    /// No features enabled.
    pub const NONE: Features = Features(0);
    /// Fully read the request body before invoking the guest.
    pub const BUFFER_REQUEST: Features = Features(1);
    /// Capture the downstream response so the guest can read and rewrite it.
    pub const BUFFER_RESPONSE: Features = Features(2);
    /// Allow the guest to observe and emit trailers.
    pub const TRAILERS: Features = Features(4);

    const KNOWN: u32 = 0b111;

    /// Build a mask from raw bits, dropping bits the host does not honor.
    pub fn from_bits(bits: u32) -> Features {
        Features(bits & Self::KNOWN)
    }

    /// The raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every feature in `other` is enabled in `self`.
    pub fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// The union of two masks.
    pub fn union(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }

    /// Whether no features are enabled.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        self.union(rhs)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Features) {
        *self = self.union(rhs);
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        let mut put = |name: &str, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)
        };
        if self.contains(Self::BUFFER_REQUEST) {
            put("buffer-request", f)?;
        }
        if self.contains(Self::BUFFER_RESPONSE) {
            put("buffer-response", f)?;
        }
        if self.contains(Self::TRAILERS) {
            put("trailers", f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_monotonic() {
        let mut mask = Features::NONE;
        mask |= Features::BUFFER_REQUEST;
        assert!(mask.contains(Features::BUFFER_REQUEST));

        mask |= Features::TRAILERS;
        assert!(mask.contains(Features::BUFFER_REQUEST));
        assert!(mask.contains(Features::TRAILERS));

        // Unioning an already-present feature changes nothing.
        assert_eq!(mask.union(Features::TRAILERS), mask);
    }

    #[test]
    fn unknown_bits_are_masked() {
        let mask = Features::from_bits(0xFFFF_FFFF);
        assert_eq!(
            mask,
            Features::BUFFER_REQUEST | Features::BUFFER_RESPONSE | Features::TRAILERS
        );
        assert_eq!(mask.bits(), 0b111);
    }

    #[test]
    fn contains_requires_all_bits() {
        let mask = Features::BUFFER_REQUEST | Features::TRAILERS;
        assert!(mask.contains(Features::BUFFER_REQUEST));
        assert!(!mask.contains(Features::BUFFER_RESPONSE));
        assert!(!mask.contains(Features::BUFFER_RESPONSE | Features::TRAILERS));
        assert!(mask.contains(Features::NONE));
    }

    #[test]
    fn display_names() {
        assert_eq!(Features::NONE.to_string(), "none");
        assert_eq!(Features::BUFFER_REQUEST.to_string(), "buffer-request");
        assert_eq!(
            (Features::BUFFER_RESPONSE | Features::TRAILERS).to_string(),
            "buffer-response|trailers"
        );
    }
}
