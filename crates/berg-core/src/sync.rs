//! Snapshot + diff stream reconciliation.
//!
//! Binance depth streams are only usable when spliced onto a REST snapshot:
//! diffs buffered before the snapshot are replayed if they overlap it, and
//! every applied diff must continue the update-ID sequence exactly. Any gap
//! means lost state, and the only safe recovery is a full resync.

use berg_common::{BookSide, BookSnapshot, DepthDiff};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::book::OrderBook;

/// Recoverable synchronization failures. Either kind invalidates the
/// local book; the engine drops state and resyncs from a fresh snapshot.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SyncError {
    #[error("update id gap: expected first_update_id <= {expected}, got {got}")]
    Gap { expected: u64, got: u64 },

    #[error("buffered diffs do not cover snapshot {snapshot_id}: first retained diff spans {first}..={last}")]
    SnapshotNotCovered {
        snapshot_id: u64,
        first: u64,
        last: u64,
    },

    #[error("crossed book after diff {update_id}: best bid {bid} >= best ask {ask}")]
    CrossedBook {
        update_id: u64,
        bid: Decimal,
        ask: Decimal,
    },
}

/// Apply one diff to a synchronized book.
///
/// Returns `Ok(false)` for stale duplicates (`final_update_id` at or below
/// the book), `Ok(true)` when applied. Fails with [`SyncError::Gap`] when
/// update IDs are missing and [`SyncError::CrossedBook`] when the result
/// violates bid < ask.
pub fn apply_diff(book: &mut OrderBook, diff: &DepthDiff) -> Result<bool, SyncError> {
    if diff.final_update_id <= book.last_update_id() {
        return Ok(false);
    }
    let expected = book.last_update_id() + 1;
    if diff.first_update_id > expected {
        return Err(SyncError::Gap {
            expected,
            got: diff.first_update_id,
        });
    }

    book.apply_levels(BookSide::Bid, &diff.bids);
    book.apply_levels(BookSide::Ask, &diff.asks);
    book.set_last_update_id(diff.final_update_id);

    if let Err((bid, ask)) = book.validate_integrity() {
        warn!(
            symbol = book.symbol(),
            %bid,
            %ask,
            update_id = diff.final_update_id,
            "crossed book after diff"
        );
        return Err(SyncError::CrossedBook {
            update_id: diff.final_update_id,
            bid,
            ask,
        });
    }
    Ok(true)
}

/// Splice a snapshot together with the diffs buffered while it was being
/// fetched.
///
/// 1. The snapshot replaces all book state.
/// 2. Buffered diffs with `final_update_id <= snapshot.last_update_id`
///    are discarded (already folded into the snapshot).
/// 3. The first retained diff must straddle the snapshot:
///    `first_update_id <= snapshot_id + 1 <= final_update_id`. A later
///    start means events were lost before buffering began.
/// 4. Remaining diffs apply sequentially under the usual gap rule.
///
/// Returns the number of buffered diffs applied.
pub fn initialize(
    book: &mut OrderBook,
    snapshot: &BookSnapshot,
    buffered: &[DepthDiff],
) -> Result<usize, SyncError> {
    book.apply_snapshot(&snapshot.bids, &snapshot.asks, snapshot.last_update_id);

    let mut applied = 0usize;
    let mut first_retained = true;
    for diff in buffered {
        if diff.final_update_id <= snapshot.last_update_id {
            continue;
        }
        if first_retained {
            first_retained = false;
            if diff.first_update_id > snapshot.last_update_id + 1 {
                return Err(SyncError::SnapshotNotCovered {
                    snapshot_id: snapshot.last_update_id,
                    first: diff.first_update_id,
                    last: diff.final_update_id,
                });
            }
        }
        if apply_diff(book, diff)? {
            applied += 1;
        }
    }
    debug!(
        symbol = book.symbol(),
        snapshot_id = snapshot.last_update_id,
        applied,
        buffered = buffered.len(),
        "book initialized from snapshot"
    );
    Ok(applied)
}
