//! Object id generation
//!
//! Each session hands out small integer ids per object kind. Counters wrap at
//! a fixed ceiling and ids are reused after the wrap; the number of live
//! objects is always far below the ceiling.

use std::sync::atomic::{AtomicU32, Ordering};

/// Default id ceiling
pub const DEFAULT_ID_CEILING: u32 = 128;

/// Kinds of objects that carry an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pool,
    Interface,
    Pipe,
    Request,
}

/// Per-session id counters
#[derive(Debug)]
pub struct IdAllocator {
    ceiling: u32,
    pool: AtomicU32,
    interface: AtomicU32,
    pipe: AtomicU32,
    request: AtomicU32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_CEILING)
    }
}

impl IdAllocator {
    /// A ceiling of 0 is treated as 1 (every id is 0)
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
            pool: AtomicU32::new(0),
            interface: AtomicU32::new(0),
            pipe: AtomicU32::new(0),
            request: AtomicU32::new(0),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Next id for `kind`: `(previous + 1) % ceiling`
    pub fn next(&self, kind: ObjectKind) -> u32 {
        let counter = match kind {
            ObjectKind::Pool => &self.pool,
            ObjectKind::Interface => &self.interface,
            ObjectKind::Pipe => &self.pipe,
            ObjectKind::Request => &self.request,
        };
        let ceiling = self.ceiling;
        let prev = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some((prev + 1) % ceiling)
            })
            .unwrap_or_else(|prev| prev);
        (prev + 1) % ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_wrap() {
        let ids = IdAllocator::new(4);
        let seq: Vec<u32> = (0..6).map(|_| ids.next(ObjectKind::Pool)).collect();
        assert_eq!(seq, vec![1, 2, 3, 0, 1, 2]);
    }

    #[test]
    fn test_kinds_are_independent() {
        let ids = IdAllocator::default();
        assert_eq!(ids.next(ObjectKind::Pool), 1);
        assert_eq!(ids.next(ObjectKind::Pool), 2);
        assert_eq!(ids.next(ObjectKind::Pipe), 1);
        assert_eq!(ids.next(ObjectKind::Request), 1);
        assert_eq!(ids.ceiling(), 128);
    }

    #[test]
    fn test_concurrent_ids_are_distinct() {
        let ids = std::sync::Arc::new(IdAllocator::new(1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ids.next(ObjectKind::Interface))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
