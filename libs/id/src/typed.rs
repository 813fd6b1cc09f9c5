//! Behavior shared by every prefixed id type.

use crate::{IdError, Ulid};

/// A ULID tagged with a fixed type prefix.
///
/// Implemented by [`define_id!`](crate::define_id); the string form of every
/// implementor is `{PREFIX}_{ulid}`.
pub trait TypedId: Copy + Sized {
    const PREFIX: &'static str;

    fn from_ulid(ulid: Ulid) -> Self;

    fn ulid(&self) -> Ulid;

    /// Parse the string form, rejecting ids that belong to another type.
    fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let (prefix, ulid) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
        if prefix != Self::PREFIX {
            return Err(IdError::WrongPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_string(),
            });
        }
        ulid.parse::<Ulid>()
            .map(Self::from_ulid)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}
