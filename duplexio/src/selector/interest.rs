use crate::sys::Filter;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of readiness operations a selection key is interested in, or
/// found ready for.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No operation.
    pub const NONE: Interest = Interest(0);

    /// The channel has data (or end-of-stream) to read.
    pub const READABLE: Interest = Interest(0b001);

    /// The channel can accept more outgoing data.
    pub const WRITABLE: Interest = Interest(0b010);

    /// A listening channel has a pending connection.
    pub const ACCEPTABLE: Interest = Interest(0b100);

    pub(crate) fn from_bits(bits: u8) -> Self {
        Interest(bits & 0b111)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITABLE)
    }

    pub fn is_acceptable(self) -> bool {
        self.contains(Interest::ACCEPTABLE)
    }

    /// Returns `true` if every operation in `other` is also in `self`.
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    /// Returns `self` without the operations in `other`.
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// The poller filter needed to observe this interest set.
    pub(crate) fn filter(self) -> Filter {
        Filter {
            read: self.is_readable() || self.is_acceptable(),
            write: self.is_writable(),
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();

        if self.is_readable() {
            names.push("READABLE");
        }
        if self.is_writable() {
            names.push("WRITABLE");
        }
        if self.is_acceptable() {
            names.push("ACCEPTABLE");
        }

        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let both = Interest::READABLE | Interest::WRITABLE;

        assert!(both.contains(Interest::READABLE));
        assert!(!both.contains(Interest::ACCEPTABLE));
        assert_eq!(both.remove(Interest::READABLE), Interest::WRITABLE);
        assert_eq!(both & Interest::WRITABLE, Interest::WRITABLE);
        assert!(!Interest::NONE.contains(Interest::NONE));
        assert_eq!(format!("{both:?}"), "READABLE | WRITABLE");
    }

    #[test]
    fn test_accept_maps_to_read_filter() {
        let filter = Interest::ACCEPTABLE.filter();
        assert!(filter.read);
        assert!(!filter.write);
    }
}
