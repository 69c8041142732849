//! Consumer-group cursor bookkeeping.
//!
//! A group's durable position is its *committed* offset: the first offset
//! not yet fully processed. Offsets complete out of order (concurrent
//! handlers, retries), so completions ahead of the committed prefix are
//! parked until the prefix catches up - only the contiguous prefix is ever
//! persisted, which is what makes crash-before-ack redelivery safe.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use uuid::Uuid;

/// An unacknowledged delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt is considered failed without an ack.
    pub deadline: Instant,
    /// Group member holding the attempt; redelivery prefers a different
    /// member.
    pub member: Uuid,
}

/// In-memory cursor state for one consumer group.
#[derive(Debug)]
pub(crate) struct GroupCursor {
    /// First offset not fully processed; the persisted value.
    committed: u64,
    /// Next offset to read from the log.
    next_read: u64,
    /// Offsets delivered and awaiting acknowledgment.
    pending: BTreeMap<u64, PendingAttempt>,
    /// Offsets completed ahead of the committed prefix.
    done_ahead: BTreeSet<u64>,
}

impl GroupCursor {
    pub fn new(start: u64) -> Self {
        Self {
            committed: start,
            next_read: start,
            pending: BTreeMap::new(),
            done_ahead: BTreeSet::new(),
        }
    }

    pub fn next_read(&self) -> u64 {
        self.next_read
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Move the read position past `offset`.
    pub fn advance_read_past(&mut self, offset: u64) {
        self.next_read = self.next_read.max(offset + 1);
    }

    /// Record a delivery attempt awaiting acknowledgment.
    pub fn begin(&mut self, offset: u64, attempt: u32, deadline: Instant, member: Uuid) {
        self.pending.insert(
            offset,
            PendingAttempt {
                attempt,
                deadline,
                member,
            },
        );
    }

    /// Mark an offset fully processed (acknowledged, skipped, or
    /// dead-lettered). Returns `true` when the committed prefix advanced.
    pub fn complete(&mut self, offset: u64) -> bool {
        self.pending.remove(&offset);
        if offset >= self.committed {
            self.done_ahead.insert(offset);
        }

        let before = self.committed;
        while self.done_ahead.remove(&self.committed) {
            self.committed += 1;
        }
        self.committed != before
    }

    /// Take a failed attempt out of the pending set for retry handling.
    /// `None` when the offset was already settled by another path.
    pub fn fail_take(&mut self, offset: u64) -> Option<PendingAttempt> {
        self.pending.remove(&offset)
    }

    /// Remove and return every pending attempt past its deadline.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u64, PendingAttempt)> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, attempt)| attempt.deadline <= now)
            .map(|(offset, _)| *offset)
            .collect();
        expired
            .into_iter()
            .filter_map(|offset| self.pending.remove(&offset).map(|a| (offset, a)))
            .collect()
    }

    /// Deliveries currently awaiting acknowledgment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_contiguous_commit() {
        let mut cursor = GroupCursor::new(0);
        let member = Uuid::new_v4();
        cursor.begin(0, 1, deadline(), member);
        cursor.begin(1, 1, deadline(), member);
        cursor.begin(2, 1, deadline(), member);

        // Out-of-order completion: 2 first, nothing commits.
        assert!(!cursor.complete(2));
        assert_eq!(cursor.committed(), 0);

        assert!(cursor.complete(0));
        assert_eq!(cursor.committed(), 1);

        // 1 completes; prefix rolls through parked 2.
        assert!(cursor.complete(1));
        assert_eq!(cursor.committed(), 3);
    }

    #[test]
    fn test_skip_without_begin() {
        let mut cursor = GroupCursor::new(0);
        assert!(cursor.complete(0));
        assert_eq!(cursor.committed(), 1);
    }

    #[test]
    fn test_fail_take_once() {
        let mut cursor = GroupCursor::new(0);
        cursor.begin(0, 1, deadline(), Uuid::new_v4());
        assert!(cursor.fail_take(0).is_some());
        assert!(cursor.fail_take(0).is_none());
        assert_eq!(cursor.committed(), 0, "failed offset stays uncommitted");
    }

    #[test]
    fn test_expiry() {
        let mut cursor = GroupCursor::new(0);
        let now = Instant::now();
        cursor.begin(0, 1, now - Duration::from_secs(1), Uuid::new_v4());
        cursor.begin(1, 2, now + Duration::from_secs(60), Uuid::new_v4());

        let expired = cursor.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 0);
        assert_eq!(expired[0].1.attempt, 1);
        assert_eq!(cursor.pending_len(), 1);
    }

    #[test]
    fn test_read_position() {
        let mut cursor = GroupCursor::new(5);
        assert_eq!(cursor.next_read(), 5);
        cursor.advance_read_past(7);
        assert_eq!(cursor.next_read(), 8);
        // Never moves backwards.
        cursor.advance_read_past(3);
        assert_eq!(cursor.next_read(), 8);
    }
}
