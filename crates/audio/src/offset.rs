//! Ring offsets that can never leave `[0, capacity)`

use common::{Error, Result};

/// A byte position inside a ring of fixed capacity
///
/// Construction rejects positions at or past the capacity and every
/// mutation wraps modulo the capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedOffset {
    value: usize,
    capacity: usize,
}

impl BoundedOffset {
    pub fn new(value: usize, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParameter(
                "ring capacity must be non-zero".to_string(),
            ));
        }
        if value >= capacity {
            return Err(Error::OutOfRange {
                offset: value,
                capacity,
            });
        }
        Ok(Self { value, capacity })
    }

    pub fn zero(capacity: usize) -> Result<Self> {
        Self::new(0, capacity)
    }

    /// Validate a pointer value read back from a hardware register
    pub fn from_register(value: u32, capacity: usize) -> Result<Self> {
        Self::new(value as usize, capacity)
    }

    pub fn get(self) -> usize {
        self.value
    }

    pub fn capacity(self) -> usize {
        self.capacity
    }

    /// Register representation
    pub fn as_register(self) -> u32 {
        self.value as u32
    }

    /// Move forward by `bytes`, wrapping at the capacity
    pub fn advance(self, bytes: usize) -> Self {
        Self {
            value: (self.value + bytes % self.capacity) % self.capacity,
            capacity: self.capacity,
        }
    }

    /// Same ring, position 0
    pub fn rewind(self) -> Self {
        Self {
            value: 0,
            capacity: self.capacity,
        }
    }

    /// Bytes from this position to the physical end of the ring
    pub fn contiguous_to_end(self) -> usize {
        self.capacity - self.value
    }

    /// Forward distance from `self` to `other`
    pub fn distance_to(self, other: BoundedOffset) -> usize {
        if other.value >= self.value {
            other.value - self.value
        } else {
            self.capacity - self.value + other.value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_offset_at_capacity() {
        assert!(BoundedOffset::new(15, 16).is_ok());
        assert!(matches!(
            BoundedOffset::new(16, 16),
            Err(Error::OutOfRange {
                offset: 16,
                capacity: 16
            })
        ));
        assert!(matches!(
            BoundedOffset::new(0, 0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_advance_wraps() {
        let off = BoundedOffset::new(10, 16).unwrap();
        assert_eq!(off.advance(6).get(), 0);
        assert_eq!(off.advance(7).get(), 1);
        assert_eq!(off.advance(16).get(), 10);
        assert_eq!(off.advance(40).get(), 2);
    }

    #[test]
    fn test_distance() {
        let a = BoundedOffset::new(12, 16).unwrap();
        let b = BoundedOffset::new(4, 16).unwrap();
        assert_eq!(a.distance_to(b), 8);
        assert_eq!(b.distance_to(a), 8);
        assert_eq!(a.distance_to(a), 0);
        assert_eq!(a.contiguous_to_end(), 4);
    }
}
