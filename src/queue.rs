//! Bounded FIFO of pending transfers, shared by every bus type.
//!
//! The queue holds the in-flight transfer at its front until the bus retires it; entries behind
//! it are waiting for dispatch. Each entry carries an [`XferId`] so a caller can withdraw a
//! transfer that hasn't been dispatched yet.

/// Default number of slots per bus.
pub const QUEUE_LEN: usize = 5;

/// Ticket returned when a transfer is accepted onto a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct XferId(pub(crate) u32);

impl XferId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

struct Slot<T> {
    id: XferId,
    item: T,
}

/// Fixed-capacity ring buffer. `head` is the oldest entry; `count` entries follow it,
/// wrapping modulo `N`.
pub struct XferQueue<T, const N: usize> {
    buf: [Option<Slot<T>>; N],
    head: usize,
    count: usize,
}

impl<T, const N: usize> Default for XferQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> XferQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            buf: [const { None }; N],
            head: 0,
            count: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == N
    }

    fn index(&self, offset: usize) -> usize {
        (self.head + offset) % N
    }

    /// Append to the back. A full queue hands the item back, leaving its state untouched.
    pub fn push(&mut self, id: XferId, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let i = self.index(self.count);
        self.buf[i] = Some(Slot { id, item });
        self.count += 1;
        Ok(())
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.buf[self.head].as_ref().map(|s| &s.item)
    }

    pub fn front_id(&self) -> Option<XferId> {
        if self.is_empty() {
            return None;
        }
        self.buf[self.head].as_ref().map(|s| s.id)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let slot = self.buf[self.head].take();
        self.head = self.index(1);
        self.count -= 1;
        slot.map(|s| s.item)
    }

    pub fn contains(&self, id: XferId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: XferId) -> Option<usize> {
        (0..self.count).find(|&off| {
            self.buf[self.index(off)]
                .as_ref()
                .is_some_and(|s| s.id == id)
        })
    }

    /// Remove the entry with `id`, closing the gap so the remaining order is kept.
    pub fn remove(&mut self, id: XferId) -> Option<T> {
        let pos = self.position(id)?;
        let removed = self.buf[self.index(pos)].take();

        for off in pos..self.count - 1 {
            let next = self.buf[self.index(off + 1)].take();
            let i = self.index(off);
            self.buf[i] = next;
        }
        self.count -= 1;

        removed.map(|s| s.item)
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (XferId, &T)> {
        (0..self.count).filter_map(move |off| {
            self.buf[self.index(off)].as_ref().map(|s| (s.id, &s.item))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>(q: &XferQueue<u8, N>) -> Vec<u8> {
        q.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn fifo_order_across_wrap() {
        let mut q: XferQueue<u8, 3> = XferQueue::new();
        for round in 0..4u8 {
            q.push(XferId(round as u32 * 2), round * 2).unwrap();
            q.push(XferId(round as u32 * 2 + 1), round * 2 + 1).unwrap();
            assert_eq!(q.pop_front(), Some(round * 2));
            assert_eq!(q.pop_front(), Some(round * 2 + 1));
        }
        assert!(q.is_empty());
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn full_queue_rejects_without_moving_indices() {
        let mut q: XferQueue<u8, 4> = XferQueue::new();
        q.push(XferId(0), 0).unwrap();
        q.pop_front();
        for v in 1..=4 {
            q.push(XferId(v as u32), v).unwrap();
        }
        let (head, count) = (q.head, q.count);

        assert_eq!(q.push(XferId(5), 5), Err(5));
        assert_eq!((q.head, q.count), (head, count));
        assert_eq!(ids(&q), vec![1, 2, 3, 4]);
    }

    #[test]
    fn remove_keeps_order() {
        let mut q: XferQueue<u8, 4> = XferQueue::new();
        // Start offset so the entries straddle the end of the buffer.
        q.push(XferId(100), 0).unwrap();
        q.push(XferId(101), 0).unwrap();
        q.pop_front();
        q.pop_front();
        for v in 1..=4 {
            q.push(XferId(v as u32), v).unwrap();
        }

        assert_eq!(q.remove(XferId(2)), Some(2));
        assert_eq!(ids(&q), vec![1, 3, 4]);
        assert_eq!(q.remove(XferId(2)), None);

        q.push(XferId(5), 5).unwrap();
        assert_eq!(ids(&q), vec![1, 3, 4, 5]);
        assert_eq!(q.front_id(), Some(XferId(1)));
    }

    #[test]
    fn remove_last_entry() {
        let mut q: XferQueue<u8, 2> = XferQueue::new();
        q.push(XferId(7), 7).unwrap();
        assert_eq!(q.remove(XferId(7)), Some(7));
        assert!(q.is_empty());
        assert_eq!(q.front(), None);
    }
}
