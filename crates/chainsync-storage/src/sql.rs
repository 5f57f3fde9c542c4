//! SQL and bookkeeping shared by the sqlx backends.

use std::ops::RangeInclusive;
use std::sync::Mutex;

use chainsync_core::SyncError;

pub(crate) const LOWEST_SQL: &str = "SELECT MIN(block_number) FROM chainsync_committed_blocks";

pub(crate) const COUNT_SQL: &str = "SELECT COUNT(*) FROM chainsync_committed_blocks";

/// Last watermark returned, tagged with the lowest row at the time.
///
/// Every block from that lowest row through the watermark is committed and
/// rows are never deleted. While the lowest row is unchanged the next
/// watermark search can therefore start at the old watermark, which keeps the
/// successor anti-join to the rows above it.
#[derive(Debug, Default)]
pub(crate) struct WatermarkCursor(Mutex<Option<(u64, u64)>>);

impl WatermarkCursor {
    /// First row the watermark search has to look at.
    pub(crate) fn scan_from(&self, lowest: u64) -> u64 {
        match self.0.lock().as_deref() {
            Ok(Some((cached_lowest, watermark))) if *cached_lowest == lowest => *watermark,
            _ => lowest,
        }
    }

    pub(crate) fn record(&self, lowest: u64, watermark: u64) {
        if let Ok(mut cursor) = self.0.lock() {
            *cursor = Some((lowest, watermark));
        }
    }
}

/// Expand committed-run boundaries into the missing numbers of `range`.
///
/// `first` is the lowest committed number inside the range. `run_ends` holds,
/// ascending, the last block of each committed run in the range together with
/// the next committed block after it (`None` past the last run).
pub(crate) fn missing_from_runs(
    range: RangeInclusive<u64>,
    first: Option<u64>,
    run_ends: &[(u64, Option<u64>)],
    limit: usize,
) -> Vec<u64> {
    let (start, end) = range.into_inner();
    let mut out = Vec::new();

    let Some(first) = first else {
        fill(&mut out, start, end, limit);
        return out;
    };
    if first > start {
        fill(&mut out, start, first - 1, limit);
    }
    for &(run_end, next) in run_ends {
        let Some(from) = run_end.checked_add(1) else {
            break;
        };
        let to = match next {
            Some(next) => next.saturating_sub(1),
            None => end,
        };
        fill(&mut out, from, to.min(end), limit);
        if out.len() >= limit {
            break;
        }
    }
    out
}

fn fill(out: &mut Vec<u64>, from: u64, to: u64, limit: usize) {
    if from > to {
        return;
    }
    let room = limit.saturating_sub(out.len());
    out.extend((from..=to).take(room));
}

pub(crate) fn to_sql(block_number: u64) -> Result<i64, SyncError> {
    i64::try_from(block_number)
        .map_err(|_| SyncError::Store(format!("block {block_number} does not fit in BIGINT")))
}

pub(crate) fn from_sql(value: i64) -> Result<u64, SyncError> {
    u64::try_from(value).map_err(|_| SyncError::Store(format!("negative block number {value}")))
}

pub(crate) fn limit_to_sql(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_reject_out_of_range() {
        assert_eq!(to_sql(42).unwrap(), 42);
        assert!(to_sql(u64::MAX).is_err());
        assert_eq!(from_sql(42).unwrap(), 42);
        assert!(from_sql(-1).is_err());
    }

    #[test]
    fn cursor_resumes_only_while_lowest_row_is_unchanged() {
        let cursor = WatermarkCursor::default();
        assert_eq!(cursor.scan_from(10), 10);

        cursor.record(10, 5_000);
        assert_eq!(cursor.scan_from(10), 5_000);
        // A commit below the old lowest row invalidates the shortcut.
        assert_eq!(cursor.scan_from(3), 3);
    }

    #[test]
    fn runs_expand_into_missing_numbers() {
        // committed in 10..=30: 12..=14, 17, 20..=25
        let runs = [(14, Some(17)), (17, Some(20)), (25, None)];
        assert_eq!(
            missing_from_runs(10..=30, Some(12), &runs, 100),
            vec![10, 11, 15, 16, 18, 19, 26, 27, 28, 29, 30]
        );
        assert_eq!(missing_from_runs(10..=30, Some(12), &runs, 4), vec![10, 11, 15, 16]);
        assert_eq!(missing_from_runs(10..=13, None, &[], 100), vec![10, 11, 12, 13]);
        assert!(missing_from_runs(12..=14, Some(12), &[(14, None)], 10).is_empty());
    }

    #[test]
    fn huge_trailing_gap_stops_at_limit() {
        assert_eq!(
            missing_from_runs(1..=u64::MAX, Some(1), &[(1, None)], 3),
            vec![2, 3, 4]
        );
    }
}
