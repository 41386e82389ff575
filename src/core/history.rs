//! Snapshot History
//!
//! Fixed-capacity ring of pre-built entries. The write cursor always points
//! at the most recently claimed entry; claiming moves it forward and hands
//! the slot back for in-place overwrite. Entries older than the capacity are
//! lost when the ring wraps.
//!
//! Offsets are relative to the cursor: `0` is the latest entry, `-1` the one
//! before it, down to `-(capacity - 1)`.

/// Fixed-capacity circular buffer indexed by relative offset.
#[derive(Clone, Debug)]
pub struct History<T> {
    entries: Vec<T>,
    cursor: usize,
}

impl<T> History<T> {
    /// Pre-build `capacity` entries with `factory`.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize, mut factory: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            entries: (0..capacity).map(|_| factory()).collect(),
            cursor: 0,
        }
    }

    /// Number of entries (fixed).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn index(&self, offset: i32) -> usize {
        let len = self.entries.len() as i64;
        debug_assert!(
            (offset as i64).abs() < len,
            "history offset {} outside window of {}",
            offset,
            len
        );
        (self.cursor as i64 + offset as i64).rem_euclid(len) as usize
    }

    /// Most recently committed entry.
    #[inline]
    pub fn peek(&self) -> &T {
        &self.entries[self.cursor]
    }

    /// Mutable access to the most recent entry.
    #[inline]
    pub fn peek_mut(&mut self) -> &mut T {
        &mut self.entries[self.cursor]
    }

    /// Advance the cursor and return the newly claimed slot.
    ///
    /// The slot still holds whatever it held `capacity` claims ago.
    #[inline]
    pub fn claim_next(&mut self) -> &mut T {
        self.cursor = (self.cursor + 1) % self.entries.len();
        &mut self.entries[self.cursor]
    }

    /// Advance the cursor and return `(previous, claimed)`.
    ///
    /// With a capacity of one both refer to the same slot, so `previous` is
    /// `None` in that case.
    pub fn claim_next_with_previous(&mut self) -> (Option<&T>, &mut T) {
        let previous = self.cursor;
        self.claim_next();
        let current = self.cursor;
        pair(&mut self.entries, previous, current)
    }

    /// Entry at a relative offset (`0` = latest, negative = older).
    #[inline]
    pub fn get(&self, offset: i32) -> &T {
        &self.entries[self.index(offset)]
    }

    /// Mutable entry at a relative offset.
    #[inline]
    pub fn get_mut(&mut self, offset: i32) -> &mut T {
        let index = self.index(offset);
        &mut self.entries[index]
    }

    /// The entry at `offset - 1` (read) and the one at `offset` (write).
    pub fn get_with_previous_mut(&mut self, offset: i32) -> (Option<&T>, &mut T) {
        let previous = self.index(offset - 1);
        let current = self.index(offset);
        pair(&mut self.entries, previous, current)
    }

    /// Iterate from newest (offset 0) to oldest.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = (i32, &T)> + '_ {
        (0..self.entries.len() as i32).map(move |i| (-i, self.get(-i)))
    }

    /// Offset of the newest entry matching `predicate`.
    pub fn position_newest(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<i32> {
        self.iter_newest_first().find(|(_, entry)| predicate(entry)).map(|(offset, _)| offset)
    }

    /// Apply `f` to every entry, in storage order.
    pub fn for_each_mut(&mut self, f: impl FnMut(&mut T)) {
        self.entries.iter_mut().for_each(f);
    }
}

/// Borrow one entry shared and another mutably.
fn pair<T>(entries: &mut [T], read: usize, write: usize) -> (Option<&T>, &mut T) {
    if read == write {
        return (None, &mut entries[write]);
    }
    if read < write {
        let (head, tail) = entries.split_at_mut(write);
        (Some(&head[read]), &mut tail[0])
    } else {
        let (head, tail) = entries.split_at_mut(read);
        (Some(&tail[0]), &mut head[write])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_claim_and_peek() {
        let mut history = History::new(3, || 0u32);
        *history.claim_next() = 1;
        *history.claim_next() = 2;
        assert_eq!(*history.peek(), 2);
        assert_eq!(*history.get(-1), 1);
        assert_eq!(*history.get(-2), 0);
    }

    #[test]
    fn test_claim_with_previous() {
        let mut history = History::new(4, || 0u32);
        *history.peek_mut() = 7;
        let (previous, next) = history.claim_next_with_previous();
        *next = previous.copied().unwrap_or_default() + 1;
        assert_eq!(*history.peek(), 8);
        assert_eq!(*history.get(-1), 7);
    }

    #[test]
    fn test_capacity_one_has_no_previous() {
        let mut history = History::new(1, || 5u32);
        let (previous, next) = history.claim_next_with_previous();
        assert!(previous.is_none());
        assert_eq!(*next, 5);
    }

    #[test]
    fn test_get_with_previous_mut_across_wrap() {
        let mut history = History::new(3, || 0u32);
        for value in 1..=4 {
            *history.claim_next() = value;
        }
        // cursor wrapped; -1 and -2 straddle the storage boundary
        let (older, newer) = history.get_with_previous_mut(-1);
        assert_eq!(older.copied(), Some(2));
        *newer += 10;
        assert_eq!(*history.get(-1), 13);
    }

    #[test]
    fn test_iter_newest_first() {
        let mut history = History::new(3, || 0u32);
        *history.claim_next() = 1;
        *history.claim_next() = 2;
        let seen: Vec<_> = history.iter_newest_first().map(|(o, v)| (o, *v)).collect();
        assert_eq!(seen, vec![(0, 2), (-1, 1), (-2, 0)]);
    }

    #[test]
    fn test_position_newest() {
        let mut history = History::new(4, || 0u32);
        for value in [5, 6, 5, 7] {
            *history.claim_next() = value;
        }
        assert_eq!(history.position_newest(|v| *v == 5), Some(-1));
        assert_eq!(history.position_newest(|v| *v == 6), Some(-2));
        assert_eq!(history.position_newest(|v| *v == 9), None);
    }

    proptest! {
        #[test]
        fn prop_wraps_correctly(capacity in 1usize..16, extra in 0usize..40) {
            let mut history = History::new(capacity, || 0usize);
            let claims = capacity + extra;
            for k in 1..=claims {
                *history.claim_next() = k;
            }
            prop_assert_eq!(*history.get(0), claims);
            if capacity > 1 {
                prop_assert_eq!(*history.get(-1), claims - 1);
            }
        }
    }
}
