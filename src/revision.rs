use std::fmt;

/// An opaque, totally ordered token representing an instantaneous, consistent
/// snapshot of the whole store.
///
/// Revisions are issued exclusively by the
/// [`RevisionPool`](crate::pool::RevisionPool); a revision issued later always
/// compares greater than one issued earlier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Revision(u64);

impl Revision {
    /// The revision of an empty store, before any commit.
    pub const ZERO: Revision = Revision(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The revision immediately preceding this one.
    ///
    /// Revision numbers are sequential, so the preceding revision is always
    /// `self - 1`. Saturates at zero.
    pub const fn prev(&self) -> Revision {
        Revision(self.0.saturating_sub(1))
    }

    pub const fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The value of some fact as of a given revision, including the *absence* of
/// a value.
///
/// An index lookup at revision `R` yields a `Revisioned` carrying the revision
/// of the entry that answered the lookup (not `R` itself), or [`absent`] when
/// no entry at or before `R` exists.
///
/// [`absent`]: Revisioned::absent
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Revisioned<T> {
    revision: Revision,
    value: Option<T>,
}

impl<T> Revisioned<T> {
    pub fn new(revision: Revision, value: Option<T>) -> Self {
        Self { revision, value }
    }

    /// A fact that has no value at any revision up to and including the
    /// requested one.
    pub fn absent(revision: Revision) -> Self {
        Self { revision, value: None }
    }

    /// The revision of the entry that produced this value.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Revision::new(1) < Revision::new(2));
        assert_eq!(Revision::new(3).prev(), Revision::new(2));
        assert_eq!(Revision::ZERO.prev(), Revision::ZERO);
        assert_eq!(Revision::new(3).next(), Revision::new(4));
    }

    #[test]
    fn test_revisioned() {
        let present = Revisioned::new(Revision::new(7), Some(42));
        assert_eq!(present.revision(), Revision::new(7));
        assert_eq!(present.value(), Some(&42));
        assert!(!present.is_absent());

        let absent = Revisioned::<u32>::absent(Revision::new(7));
        assert!(absent.is_absent());
        assert_eq!(absent.into_value(), None);
    }
}
