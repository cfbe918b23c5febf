//! Half-open time periods `[begin, end)` and interval merging.

use agent_proto::time::Time;
use chrono::TimeDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub begin: Time,
    pub end: Time,
}

impl Period {
    pub fn new(begin: Time, end: Time) -> Self {
        Period { begin, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.begin
    }

    /// A period is valid when it covers a non-empty range.
    pub fn is_valid(&self) -> bool {
        self.begin < self.end
    }

    /// Open-interval intersection: touching endpoints do not intersect.
    pub fn intersects(&self, other: &Period) -> bool {
        self.begin < other.end && self.end > other.begin
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.begin.cmp(&other.begin).then(self.end.cmp(&other.end))
    }
}

/// Merge touching and overlapping periods into a minimal sorted set.
pub fn squash(mut periods: Vec<Period>) -> Vec<Period> {
    if periods.is_empty() {
        return periods;
    }

    periods.sort();

    let mut result = Vec::with_capacity(periods.len());
    let mut current = periods[0];
    for p in periods.into_iter().skip(1) {
        if current.end >= p.begin {
            current.end = current.end.max(p.end);
        } else {
            result.push(current);
            current = p;
        }
    }
    result.push(current);
    result
}
