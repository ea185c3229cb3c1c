//! Periodic priority recalculation for auto-priority items and bundles.

use std::time::Duration;

use super::priority::Priority;

/// Age after which a progress-ranked entry is lifted one level.
pub const PROGRESS_AGING: Duration = Duration::from_secs(24 * 60 * 60);

/// Ranks one entry on its own progress.
///
/// The downloaded fraction picks a level in tenths: up to 20% is `Low`,
/// up to 50% `Normal`, up to 80% `High`, the rest `Highest`. Entries older
/// than [`PROGRESS_AGING`] that are below `High` move up one level so stale
/// downloads are not starved.
pub fn progress(downloaded: u64, size: u64, elapsed: Duration) -> Priority {
    if size == 0 {
        return Priority::Normal;
    }
    let tenths = (downloaded.min(size) as u128 * 10 / size as u128) as u64;
    let by_progress = match tenths {
        0..=2 => Priority::Low,
        3..=5 => Priority::Normal,
        6..=8 => Priority::High,
        _ => Priority::Highest,
    };
    if elapsed >= PROGRESS_AGING && by_progress < Priority::High {
        Priority::from_index(by_progress.index() + 1).unwrap_or(by_progress)
    } else {
        by_progress
    }
}

/// Input to [`balanced`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<K> {
    pub key: K,
    /// Bytes per second across running downloads.
    pub speed: u64,
    pub online_sources: usize,
}

/// Ranks a batch of entries against each other.
///
/// Speed and source count are each scaled to 0..=100 against the batch
/// maximum and summed. Distinct scores are split into groups of
/// `max(1, distinct / 3)` from the top; the groups map to `High`, `Normal`
/// and `Low`, with every further group staying at `Low`. With fewer than two
/// distinct scores nothing is returned.
pub fn balanced<K: Copy>(candidates: &[Candidate<K>]) -> Vec<(K, Priority)> {
    let max_speed = candidates.iter().map(|c| c.speed).max().unwrap_or(0);
    let max_sources = candidates.iter().map(|c| c.online_sources).max().unwrap_or(0);

    let scale = |value: u64, max: u64| -> u64 {
        if max == 0 {
            0
        } else {
            value * 100 / max
        }
    };

    let scored: Vec<(K, u64)> = candidates
        .iter()
        .map(|c| {
            let score = scale(c.speed, max_speed)
                + scale(c.online_sources as u64, max_sources as u64);
            (c.key, score)
        })
        .collect();

    let mut distinct: Vec<u64> = scored.iter().map(|(_, s)| *s).collect();
    distinct.sort_unstable_by(|a, b| b.cmp(a));
    distinct.dedup();
    if distinct.len() < 2 {
        return Vec::new();
    }

    let group = (distinct.len() / 3).max(1);
    let level_of = |score: u64| -> Priority {
        let rank = distinct.iter().position(|s| *s == score).unwrap_or(0);
        match rank / group {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    };

    scored
        .into_iter()
        .map(|(key, score)| (key, level_of(score)))
        .collect()
}
