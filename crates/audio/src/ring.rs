//! Circular stream buffer over a DMA region
//!
//! The buffer never reads the hardware registers itself. Callers pass the
//! current hardware read and write pointers in as [`BoundedOffset`]s and get
//! back a [`FlowStatus`] plus the pointer value to program next. Full and
//! empty are ordinary flow states, not errors.

use crate::dma::{DmaMemory, DmaRegion};
use crate::offset::BoundedOffset;
use crate::params::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE, SAFETY_MARGIN};
use common::{Error, Result};
use tracing::debug;

/// Outcome of a produce or consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Normal,
    /// Not enough free space, try again later
    Full,
    /// Not enough data for one transfer chunk, try again later
    Empty,
}

/// Result of [`CircularStreamBuffer::produce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Produced {
    pub status: FlowStatus,
    /// Write pointer after the copy (unchanged when full)
    pub write: BoundedOffset,
}

/// Result of [`CircularStreamBuffer::consume`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    pub status: FlowStatus,
    pub bytes: usize,
    /// Read pointer after the copy (unchanged when empty)
    pub read: BoundedOffset,
}

/// Free bytes the producer may see given both hardware pointers
///
/// Equal pointers mean an empty ring.
pub fn writable_bytes(write: BoundedOffset, read: BoundedOffset) -> usize {
    if write.get() >= read.get() {
        write.capacity() - (write.get() - read.get())
    } else {
        read.get() - write.get()
    }
}

/// Unread bytes between the read and write pointers
pub fn readable_bytes(write: BoundedOffset, read: BoundedOffset) -> usize {
    read.distance_to(write)
}

/// One direction's ring buffer
#[derive(Debug)]
pub struct CircularStreamBuffer {
    region: DmaRegion,
    capacity: usize,
    write_offset: BoundedOffset,
}

impl CircularStreamBuffer {
    pub fn new(region: DmaRegion) -> Result<Self> {
        let capacity = region.size();
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&capacity) {
            return Err(Error::InvalidParameter(format!(
                "buffer size {} outside {}..={}",
                capacity, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }
        Ok(Self {
            region,
            capacity,
            write_offset: BoundedOffset::zero(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn phys_addr(&self) -> u64 {
        self.region.phys_addr()
    }

    /// Shared memory backing the ring
    pub fn memory(&self) -> &DmaMemory {
        self.region.memory()
    }

    /// Software write offset left by the last copy-in
    pub fn write_offset(&self) -> BoundedOffset {
        self.write_offset
    }

    /// Parse a raw register value against this ring's capacity
    pub fn offset(&self, value: u32) -> Result<BoundedOffset> {
        BoundedOffset::from_register(value, self.capacity)
    }

    /// Zero the memory and rewind the software offset
    pub fn clear(&mut self) {
        self.region.memory().lock().fill(0);
        self.write_offset = self.write_offset.rewind();
    }

    /// Copy `data` in at `pos`, wrapping to the start when it crosses the end
    pub fn copy_in(&mut self, pos: BoundedOffset, data: &[u8]) -> Result<BoundedOffset> {
        self.check_offset(pos)?;
        if data.len() > self.capacity {
            return Err(Error::OutOfRange {
                offset: pos.get() + data.len(),
                capacity: self.capacity,
            });
        }

        let start = pos.get();
        let first = data.len().min(pos.contiguous_to_end());
        {
            let mut mem = self.region.memory().lock();
            mem[start..start + first].copy_from_slice(&data[..first]);
            if first < data.len() {
                let rest = data.len() - first;
                mem[..rest].copy_from_slice(&data[first..]);
            }
        }

        let next = pos.advance(data.len());
        self.write_offset = next;
        Ok(next)
    }

    /// Copy up to `out.len()` bytes from `pos`, stopping at the physical end
    pub fn copy_out(&self, pos: BoundedOffset, out: &mut [u8]) -> Result<(usize, BoundedOffset)> {
        self.check_offset(pos)?;
        let n = out.len().min(pos.contiguous_to_end());
        let start = pos.get();
        out[..n].copy_from_slice(&self.region.memory().lock()[start..start + n]);
        Ok((n, pos.advance(n)))
    }

    /// Producer step: copy `data` at the hardware write pointer if it fits
    /// with [`SAFETY_MARGIN`] to spare
    pub fn produce(
        &mut self,
        write: BoundedOffset,
        read: BoundedOffset,
        data: &[u8],
    ) -> Result<Produced> {
        self.check_offset(write)?;
        self.check_offset(read)?;
        let available = writable_bytes(write, read);
        if available < data.len() + SAFETY_MARGIN {
            debug!(
                "Ring full: r={} w={} available={} requested={}",
                read.get(),
                write.get(),
                available,
                data.len()
            );
            return Ok(Produced {
                status: FlowStatus::Full,
                write,
            });
        }

        let next = self.copy_in(write, data)?;
        Ok(Produced {
            status: FlowStatus::Normal,
            write: next,
        })
    }

    /// Consumer step: copy one chunk from the hardware read pointer
    ///
    /// A read never wraps. When the unread data crosses the end of the ring
    /// only the tail segment is returned and the next call continues at 0.
    pub fn consume(
        &self,
        write: BoundedOffset,
        read: BoundedOffset,
        chunk: usize,
        out: &mut [u8],
    ) -> Result<Consumed> {
        self.check_offset(write)?;
        self.check_offset(read)?;
        if chunk == 0 || out.len() < chunk {
            return Err(Error::InvalidParameter(format!(
                "read of {} bytes into a {} byte buffer",
                chunk,
                out.len()
            )));
        }

        let available = readable_bytes(write, read);
        if available < chunk {
            debug!(
                "Ring empty: r={} w={} available={} chunk={}",
                read.get(),
                write.get(),
                available,
                chunk
            );
            return Ok(Consumed {
                status: FlowStatus::Empty,
                bytes: 0,
                read,
            });
        }

        let (bytes, next) = self.copy_out(read, &mut out[..chunk])?;
        Ok(Consumed {
            status: FlowStatus::Normal,
            bytes,
            read: next,
        })
    }

    /// Give the region back so it can be freed
    pub fn into_region(self) -> DmaRegion {
        self.region
    }

    fn check_offset(&self, pos: BoundedOffset) -> Result<()> {
        if pos.capacity() != self.capacity {
            return Err(Error::InvalidParameter(format!(
                "offset for a {} byte ring used on a {} byte ring",
                pos.capacity(),
                self.capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{HeapAllocator, PhysicalBufferAllocator, DMA_ALIGNMENT};

    fn ring(capacity: usize) -> CircularStreamBuffer {
        let alloc = HeapAllocator::new();
        CircularStreamBuffer::new(alloc.allocate(capacity, DMA_ALIGNMENT).unwrap()).unwrap()
    }

    fn at(ring: &CircularStreamBuffer, value: usize) -> BoundedOffset {
        BoundedOffset::new(value, ring.capacity()).unwrap()
    }

    #[test]
    fn test_rejects_capacity_outside_limits() {
        let alloc = HeapAllocator::new();
        let small = alloc.allocate(MIN_BUFFER_SIZE - 1, DMA_ALIGNMENT).unwrap();
        assert!(matches!(
            CircularStreamBuffer::new(small),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_free_space_both_orders() {
        let r = ring(MIN_BUFFER_SIZE);
        assert_eq!(writable_bytes(at(&r, 100), at(&r, 100)), MIN_BUFFER_SIZE);
        assert_eq!(writable_bytes(at(&r, 300), at(&r, 100)), MIN_BUFFER_SIZE - 200);
        assert_eq!(writable_bytes(at(&r, 100), at(&r, 300)), 200);
        assert_eq!(readable_bytes(at(&r, 100), at(&r, 300)), MIN_BUFFER_SIZE - 200);
    }

    #[test]
    fn test_copy_in_splits_at_end() {
        let mut r = ring(MIN_BUFFER_SIZE);
        let pos = at(&r, MIN_BUFFER_SIZE - 4);
        let next = r.copy_in(pos, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(next.get(), 2);
        assert_eq!(r.write_offset(), next);

        let mem = r.memory().lock();
        assert_eq!(&mem[MIN_BUFFER_SIZE - 4..], &[1, 2, 3, 4]);
        assert_eq!(&mem[..2], &[5, 6]);
    }

    #[test]
    fn test_copy_in_to_exact_end_wraps_offset() {
        let mut r = ring(MIN_BUFFER_SIZE);
        let next = r.copy_in(at(&r, MIN_BUFFER_SIZE - 4), &[9; 4]).unwrap();
        assert_eq!(next.get(), 0);
    }

    #[test]
    fn test_copy_in_rejects_oversized_data() {
        let mut r = ring(MIN_BUFFER_SIZE);
        let data = vec![0u8; MIN_BUFFER_SIZE + 1];
        let pos = at(&r, 0);
        assert!(matches!(
            r.copy_in(pos, &data),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_copy_out_stops_at_end() {
        let mut r = ring(MIN_BUFFER_SIZE);
        r.copy_in(at(&r, MIN_BUFFER_SIZE - 3), &[7, 8, 9, 10]).unwrap();

        let mut out = [0u8; 8];
        let (n, next) = r.copy_out(at(&r, MIN_BUFFER_SIZE - 3), &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[7, 8, 9]);
        assert_eq!(next.get(), 0);
    }

    #[test]
    fn test_produce_reports_full_before_margin() {
        let mut r = ring(MIN_BUFFER_SIZE);
        // 1000 bytes free
        let write = at(&r, 0);
        let read = at(&r, 1000);
        let fits = vec![1u8; 1000 - SAFETY_MARGIN];
        let too_big = vec![1u8; 1000 - SAFETY_MARGIN + 1];

        assert_eq!(r.produce(write, read, &too_big).unwrap().status, FlowStatus::Full);
        let produced = r.produce(write, read, &fits).unwrap();
        assert_eq!(produced.status, FlowStatus::Normal);
        assert_eq!(produced.write.get(), 1000 - SAFETY_MARGIN);
    }

    #[test]
    fn test_consume_empty_below_chunk() {
        let r = ring(MIN_BUFFER_SIZE);
        let mut out = [0u8; 320];
        let consumed = r.consume(at(&r, 319), at(&r, 0), 320, &mut out).unwrap();
        assert_eq!(consumed.status, FlowStatus::Empty);
        assert_eq!(consumed.bytes, 0);
        assert_eq!(consumed.read.get(), 0);
    }

    #[test]
    fn test_consume_wrapped_returns_tail_first() {
        let mut r = ring(MIN_BUFFER_SIZE);
        let start = MIN_BUFFER_SIZE - 100;
        let data: Vec<u8> = (0..=255u8).cycle().take(400).collect();
        let write = r.copy_in(at(&r, start), &data).unwrap();
        assert_eq!(write.get(), 300);

        let mut out = [0u8; 320];
        let first = r.consume(write, at(&r, start), 320, &mut out).unwrap();
        assert_eq!(first.status, FlowStatus::Normal);
        assert_eq!(first.bytes, 100);
        assert_eq!(first.read.get(), 0);
        assert_eq!(&out[..100], &data[..100]);

        // 300 bytes left, less than one chunk
        let second = r.consume(write, first.read, 320, &mut out).unwrap();
        assert_eq!(second.status, FlowStatus::Empty);

        let second = r.consume(write, first.read, 300, &mut out).unwrap();
        assert_eq!(second.bytes, 300);
        assert_eq!(&out[..300], &data[100..]);
    }
}
