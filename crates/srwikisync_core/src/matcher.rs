use std::cmp::Ordering;

use crate::leaderboard::Run;
use crate::mapping::MappingEntry;

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(Run),
    /// Nothing qualified; the existing wiki row stays as it is.
    NoQualifyingRun,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRow<'a> {
    pub entry: &'a MappingEntry,
    pub outcome: RowOutcome,
}

impl ResolvedRow<'_> {
    pub fn record(&self) -> Option<&Run> {
        match &self.outcome {
            RowOutcome::Record(run) => Some(run),
            RowOutcome::NoQualifyingRun => None,
        }
    }
}

/// Pick the record run for one mapping entry.
///
/// Runs are expected to be scoped to the entry's game/category already; any run
/// whose variable values disagree with a pinned query variable is ignored.
/// Ordering is total: fastest time, then earliest date (undated last), then
/// player name, then run id.
pub fn match_entry<'a>(entry: &'a MappingEntry, runs: &[Run]) -> ResolvedRow<'a> {
    let best = runs
        .iter()
        .filter(|run| qualifies(entry, run))
        .min_by(|left, right| compare_runs(left, right));

    ResolvedRow {
        entry,
        outcome: match best {
            Some(run) => RowOutcome::Record(run.clone()),
            None => RowOutcome::NoQualifyingRun,
        },
    }
}

pub fn qualifies(entry: &MappingEntry, run: &Run) -> bool {
    if !run.time_seconds.is_finite() || run.time_seconds < 0.0 {
        return false;
    }
    entry
        .pinned_variables()
        .all(|(id, value)| run.variable_values.get(id).map(String::as_str) == Some(value))
}

fn compare_runs(left: &Run, right: &Run) -> Ordering {
    left.time_seconds
        .total_cmp(&right.time_seconds)
        .then_with(|| match (left.date, right.date) {
            (Some(l), Some(r)) => l.cmp(&r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| left.player.cmp(&right.player))
        .then_with(|| left.id.cmp(&right.id))
}
