//! Which generation a cycle collects.

use std::fmt;

/// Generation targeted by a collection.
///
/// The driver is one type; phases that differ per generation (final mark in
/// particular) branch on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CollectionStrategy {
    /// Young regions only.
    Young = 0,
    /// Old regions, preparing mixed evacuations.
    Old = 1,
    /// The whole heap.
    Global = 2,
}

impl CollectionStrategy {
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Old,
            2 => Self::Global,
            _ => Self::Young,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Young => "Young",
            Self::Old => "Old",
            Self::Global => "Global",
        }
    }

    /// Whether marking with this strategy covers old regions.
    #[must_use]
    pub const fn marks_old(self) -> bool {
        matches!(self, Self::Old | Self::Global)
    }
}

impl fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_u8() {
        for s in [
            CollectionStrategy::Young,
            CollectionStrategy::Old,
            CollectionStrategy::Global,
        ] {
            assert_eq!(CollectionStrategy::from_u8(s as u8), s);
        }
        assert_eq!(CollectionStrategy::Old.to_string(), "Old");
        assert!(!CollectionStrategy::Young.marks_old());
    }
}
