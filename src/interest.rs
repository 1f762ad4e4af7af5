use std::num::NonZeroU8;
use std::{fmt, ops};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// Interest used in arming a registration.
///
/// The set can never be empty: a one-shot registration armed with no
/// interest bits would only report hangups edge-wise, which is exactly
/// the race the rearm rules exist to avoid.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct Interest(NonZeroU8);

impl Interest {
    pub(crate) const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    pub(crate) const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s. Does the same thing as the `BitOr`
    /// implementation, but is a constant function.
    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub(crate) const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(f, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(f, " | ")?;
            }
            write!(f, "WRITABLE")?;
        }
        Ok(())
    }
}
