//! A singly linked list that only remembers its tail. Every link points at its
//! predecessor, so pushing is O(1) and walking always goes newest-first.
//!
//! ```plaintext
//! head                      tail
//! +-----+    +-----+    +-----+
//! |  a  |<---|  b  |<---|  c  |
//! +-----+    +-----+    +-----+
//! ```
//!
//! Lookups (`find_mut()`, `remove()`) are linear. All of the users of this
//! (allocation tracking, exit callbacks, lock cleanup) are shutdown paths, not
//! hot paths.

struct Link<T> {
    value: T,
    prev: Option<Box<Link<T>>>,
}

pub struct Chain<T> {
    tail: Option<Box<Link<T>>>,
    len: usize,
}

impl<T> Chain<T> {
    /// Construct an empty [`Chain`]. This does not allocate.
    pub const fn new() -> Self {
        Self { tail: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    /// Append `value` at the tail
    pub fn push(&mut self, value: T) {
        let prev = self.tail.take();
        self.tail = Some(Box::new(Link { value, prev }));
        self.len += 1;
    }

    /// Take the most recently pushed value
    pub fn pop(&mut self) -> Option<T> {
        let mut link = self.tail.take()?;
        self.tail = link.prev.take();
        self.len -= 1;
        Some(link.value)
    }

    /// Walk from the tail towards the head
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.tail.as_deref(),
        }
    }

    /// Get the slot that holds the `steps`-th link counting back from the
    /// tail (`0` is the tail itself).
    fn slot(&mut self, steps: usize) -> Option<&mut Option<Box<Link<T>>>> {
        let mut slot = &mut self.tail;
        for _ in 0..steps {
            slot = &mut slot.as_mut()?.prev;
        }
        Some(slot)
    }

    /// Find the newest value matching `pred`
    pub fn find_mut<F>(&mut self, pred: F) -> Option<&mut T>
    where
        F: FnMut(&T) -> bool,
    {
        let steps = self.iter().position(pred)?;
        let link = self.slot(steps)?.as_mut()?;
        Some(&mut link.value)
    }

    /// Unlink and return the newest value matching `pred`
    pub fn remove<F>(&mut self, pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let steps = self.iter().position(pred)?;
        let slot = self.slot(steps)?;
        let mut link = slot.take()?;
        *slot = link.prev.take();
        self.len -= 1;
        Some(link.value)
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        // Iteratively, so a long chain can't blow the stack through nested
        // `Box` drops
        while self.pop().is_some() {}
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Link<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next?;
        self.next = link.prev.as_deref();
        Some(&link.value)
    }
}

#[cfg(test)]
mod tests {
    use super::Chain;

    fn chain_of(values: &[u32]) -> Chain<u32> {
        let mut chain = Chain::new();
        for v in values {
            chain.push(*v);
        }
        chain
    }

    #[test]
    fn iterates_newest_first() {
        let chain = chain_of(&[1, 2, 3]);
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn pop_reverses_push_order() {
        let mut chain = chain_of(&[1, 2, 3]);
        assert_eq!(chain.pop(), Some(3));
        assert_eq!(chain.pop(), Some(2));
        assert_eq!(chain.pop(), Some(1));
        assert_eq!(chain.pop(), None);
        assert!(chain.is_empty());
    }

    #[test]
    fn remove_unlinks_tail_middle_and_head() {
        let mut chain = chain_of(&[1, 2, 3, 4]);
        assert_eq!(chain.remove(|v| *v == 4), Some(4));
        assert_eq!(chain.remove(|v| *v == 2), Some(2));
        assert_eq!(chain.remove(|v| *v == 1), Some(1));
        assert_eq!(chain.remove(|v| *v == 42), None);
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn find_mut_updates_in_place() {
        let mut chain = chain_of(&[1, 2, 3]);
        *chain.find_mut(|v| *v == 2).expect("2 is in the chain") = 20;
        assert_eq!(chain.iter().copied().collect::<Vec<_>>(), vec![3, 20, 1]);
        assert!(chain.find_mut(|v| *v == 2).is_none());
    }

    #[test]
    fn long_chains_drop_without_recursion() {
        let mut chain = Chain::new();
        for i in 0..1_000_000u32 {
            chain.push(i);
        }
        drop(chain);
    }
}
