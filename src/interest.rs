use std::{fmt, ops};

/// A set of readiness kinds a caller can wait for.
///
/// `Interest` values can be combined together using the various bitwise
/// operators. Only `readable` and `writable` are honored by every driver;
/// `priority` maps to out-of-band data where the platform supports it.
///
/// # Examples
///
/// ```
/// use relay_io::Interest;
///
/// let interest = Interest::readable() | Interest::writable();
///
/// assert!(interest.is_readable());
/// assert!(interest.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct Interest(u8);

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const PRIORITY: u8 = 0b0100;

impl Interest {
    /// Returns the empty `Interest` set.
    #[inline]
    pub fn empty() -> Interest {
        Interest(0)
    }

    #[inline]
    pub fn readable() -> Interest {
        Interest(READABLE)
    }

    #[inline]
    pub fn writable() -> Interest {
        Interest(WRITABLE)
    }

    #[inline]
    pub fn priority() -> Interest {
        Interest(PRIORITY)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Interest::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Interest::writable())
    }

    #[inline]
    pub fn is_priority(&self) -> bool {
        self.contains(Interest::priority())
    }

    /// Returns true if exactly one readiness kind is present. Arming is
    /// keyed per kind, so arm operations demand a single-kind interest.
    #[inline]
    pub fn is_single(&self) -> bool {
        self.0.count_ones() == 1
    }

    #[inline]
    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    #[inline]
    pub fn contains(&self, other: Interest) -> bool {
        (*self & other) == other
    }

    /// The individual kinds present in this set, one `Interest` per bit.
    pub fn kinds(self) -> impl Iterator<Item = Interest> {
        [
            Interest::readable(),
            Interest::writable(),
            Interest::priority(),
        ]
        .into_iter()
        .filter(move |kind| self.contains(*kind))
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    #[inline]
    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::Sub for Interest {
    type Output = Interest;

    #[inline]
    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Interest::readable(), "Readable"),
            (Interest::writable(), "Writable"),
            (Interest::priority(), "Priority"),
        ];

        write!(fmt, "Interest {{")?;

        for (flag, msg) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Interest;

    #[test]
    fn combine_and_test() {
        let both = Interest::readable() | Interest::writable();

        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_priority());
        assert!(!both.is_single());
        assert!(Interest::readable().is_single());
    }

    #[test]
    fn remove_and_contains() {
        let mut interest = Interest::readable() | Interest::priority();
        interest.remove(Interest::priority());

        assert_eq!(interest, Interest::readable());
        assert!(!interest.contains(Interest::readable() | Interest::priority()));
    }

    #[test]
    fn kinds_split_bits() {
        let both = Interest::readable() | Interest::writable();
        let kinds: Vec<_> = both.kinds().collect();

        assert_eq!(kinds, vec![Interest::readable(), Interest::writable()]);
    }
}
