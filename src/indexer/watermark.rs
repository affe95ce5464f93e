use std::collections::BTreeSet;

/// Highest block below which every block has been persisted.
///
/// Catch-up batches finish out of order; the cursor may only move to the end
/// of the contiguous completed prefix so a restart never skips a block.
#[derive(Debug, Clone)]
pub struct Watermark {
    height: i64,
    pending: BTreeSet<i64>,
}

impl Watermark {
    pub fn new(cursor: i64) -> Self {
        Self {
            height: cursor,
            pending: BTreeSet::new(),
        }
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn is_done(&self, block: i64) -> bool {
        block <= self.height || self.pending.contains(&block)
    }

    /// Record `block` as persisted. Returns the new height when it moved.
    pub fn complete(&mut self, block: i64) -> Option<i64> {
        if block <= self.height {
            return None;
        }
        self.pending.insert(block);

        let before = self.height;
        while self.pending.remove(&(self.height + 1)) {
            self.height += 1;
        }
        (self.height > before).then_some(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_completion_waits_for_gap() {
        let mut mark = Watermark::new(99);
        assert_eq!(mark.complete(102), None);
        assert_eq!(mark.complete(101), None);
        assert_eq!(mark.height(), 99);
        assert!(mark.is_done(102));
        assert!(!mark.is_done(100));

        assert_eq!(mark.complete(100), Some(102));
        assert_eq!(mark.height(), 102);
    }

    #[test]
    fn test_stale_and_duplicate_blocks_are_ignored() {
        let mut mark = Watermark::new(-1);
        assert_eq!(mark.complete(0), Some(0));
        assert_eq!(mark.complete(0), None);
        assert_eq!(mark.complete(-5), None);
        assert_eq!(mark.height(), 0);
    }
}
