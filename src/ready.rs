use std::{fmt, ops};

/// A set of readiness bits.
///
/// `Ready` is used both to declare which events a file descriptor should be
/// watched for (see [`FdSet::register`] and [`FdSet::listen`]) and to report
/// which events `poll(2)` actually returned.
///
/// Only [readable] and [writable] can be requested. The remaining bits —
/// error, hup, and invalid — are delivered by the operating system whether
/// they were asked for or not, and show up only in returned values.
///
/// [`FdSet::register`]: crate::FdSet::register
/// [`FdSet::listen`]: crate::FdSet::listen
/// [readable]: Ready::READABLE
/// [writable]: Ready::WRITABLE
///
/// # Examples
///
/// ```
/// use gwio::Ready;
///
/// let ready = Ready::READABLE | Ready::WRITABLE;
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// assert!(!ready.is_error());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(u8);

// These must be unique.
const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
// The following are never requested, only returned.
const ERROR: u8 = 0b0_0100;
const HUP: u8 = 0b0_1000;
const INVALID: u8 = 0b1_0000;

impl Ready {
    /// The empty set. Returned from a poll that timed out.
    pub const EMPTY: Ready = Ready(0);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Error readiness. Only returned, never requested.
    pub const ERROR: Ready = Ready(ERROR);

    /// Hang-up readiness: the peer closed its end. Only returned, never
    /// requested.
    pub const HUP: Ready = Ready(HUP);

    /// The polled descriptor was not open. Only returned, never requested.
    pub const INVALID: Ready = Ready(INVALID);

    /// Add together two `Ready` values.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    /// Returns true if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable readiness.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if the value includes error readiness.
    pub const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    /// Returns true if the value includes hang-up readiness.
    pub const fn is_hup(self) -> bool {
        (self.0 & HUP) != 0
    }

    /// Returns true if the polled descriptor was reported as not open.
    pub const fn is_invalid(self) -> bool {
        (self.0 & INVALID) != 0
    }

    /// Returns true if `self` contains all bits of `other`.
    pub const fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for Ready {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Self;

    #[inline]
    fn bitand(self, other: Self) -> Self {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(fmt, "(empty)");
        }
        let mut one = false;
        let flags = [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::HUP, "HUP"),
            (Ready::INVALID, "INVALID"),
        ];
        for (flag, name) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", name)?;
                one = true
            }
        }
        Ok(())
    }
}
