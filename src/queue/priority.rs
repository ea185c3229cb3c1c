use std::fmt;

/// Scheduling priority of a queue item or bundle.
///
/// Ordering follows the variants: a paused entry sorts below everything and
/// is never scheduled. Callers that want the size-based default pass `None`
/// where an `Option<Priority>` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Paused = 0,
    Lowest = 1,
    Low = 2,
    #[default]
    Normal = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    pub const COUNT: usize = 6;

    /// All levels from lowest to highest.
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Paused,
        Priority::Lowest,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Highest,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_paused(self) -> bool {
        self == Priority::Paused
    }

    /// Weight of one searchable entry at this level in the auto-search draw.
    pub fn search_weight(self) -> usize {
        self.index().saturating_sub(1)
    }

    /// Levels from `self` down to `min`, highest first.
    pub fn descending_to(self, min: Priority) -> impl Iterator<Item = Priority> {
        let top = self.index();
        let bottom = min.index().max(Priority::Lowest.index());
        (bottom..=top).rev().filter_map(Priority::from_index)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Paused => "paused",
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Highest => "highest",
        };
        f.write_str(name)
    }
}
