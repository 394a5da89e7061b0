//! Physical buffer allocation
//!
//! The ring lives in memory the DMA engine can address. Two strategies sit
//! behind [`PhysicalBufferAllocator`]: [`HeapAllocator`] for hosts where any
//! heap memory will do, and [`ReservedRegionAllocator`] for targets that carve
//! audio buffers out of a fixed reserved window. Both hand out [`DmaRegion`]s
//! whose memory is shared with whatever plays the device side, looked up by
//! physical address the way a DMA engine would.

use common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Alignment requested for audio ring buffers
pub const DMA_ALIGNMENT: usize = 64;

/// Memory shared between the CPU side and the device side
#[derive(Debug, Clone)]
pub struct DmaMemory(Arc<Mutex<Vec<u8>>>);

impl DmaMemory {
    fn zeroed(size: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0u8; size])))
    }

    /// Lock the memory for a copy
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A buffer returned by an allocator
#[derive(Debug)]
pub struct DmaRegion {
    phys_addr: u64,
    size: usize,
    memory: DmaMemory,
}

impl DmaRegion {
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.memory
    }
}

/// Allocates and frees DMA-reachable buffers
pub trait PhysicalBufferAllocator: Send + Sync {
    /// Allocate `size` bytes whose physical address is a multiple of `alignment`
    fn allocate(&self, size: usize, alignment: usize) -> Result<DmaRegion>;

    /// Return a region to the allocator
    fn free(&self, region: DmaRegion);

    /// Device-side view of a live region
    fn lookup(&self, phys_addr: u64) -> Option<DmaMemory>;
}

fn check_request(size: usize, alignment: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidParameter("allocation size is zero".to_string()));
    }
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(Error::InvalidParameter(format!(
            "alignment {} is not a power of two",
            alignment
        )));
    }
    Ok(())
}

fn align_up(value: u64, alignment: usize) -> u64 {
    let a = alignment as u64;
    value.div_ceil(a) * a
}

/// Heap-backed allocator with synthetic physical addresses
#[derive(Debug)]
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

#[derive(Debug)]
struct HeapState {
    next_addr: u64,
    live: HashMap<u64, DmaMemory>,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_addr: 0x1000_0000,
                live: HashMap::new(),
            }),
        }
    }

    /// Number of regions currently allocated
    pub fn live_regions(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PhysicalBufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<DmaRegion> {
        check_request(size, alignment)?;

        let mut state = self.lock();
        let phys_addr = align_up(state.next_addr, alignment);
        state.next_addr = phys_addr + size as u64;

        let memory = DmaMemory::zeroed(size);
        state.live.insert(phys_addr, memory.clone());
        debug!("Allocated {} bytes at {:#x}", size, phys_addr);

        Ok(DmaRegion {
            phys_addr,
            size,
            memory,
        })
    }

    fn free(&self, region: DmaRegion) {
        if self.lock().live.remove(&region.phys_addr).is_none() {
            warn!("Free of unknown region {:#x}", region.phys_addr);
        } else {
            debug!("Freed {} bytes at {:#x}", region.size, region.phys_addr);
        }
    }

    fn lookup(&self, phys_addr: u64) -> Option<DmaMemory> {
        self.lock().live.get(&phys_addr).cloned()
    }
}

/// Allocator for a fixed reserved window `[base, base + budget)`
///
/// First-fit over the window; fails with `ResourceExhausted` when no gap is
/// large enough.
#[derive(Debug)]
pub struct ReservedRegionAllocator {
    base: u64,
    budget: usize,
    /// Live allocations keyed by physical address: (size, memory)
    live: Mutex<HashMap<u64, (usize, DmaMemory)>>,
}

impl ReservedRegionAllocator {
    pub fn new(base: u64, budget: usize) -> Self {
        Self {
            base,
            budget,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.lock().values().map(|(size, _)| *size).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, (usize, DmaMemory)>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PhysicalBufferAllocator for ReservedRegionAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<DmaRegion> {
        check_request(size, alignment)?;

        let mut live = self.lock();
        let mut taken: Vec<(u64, u64)> = live
            .iter()
            .map(|(addr, (len, _))| (*addr, *addr + *len as u64))
            .collect();
        taken.sort_unstable();

        let end = self.base + self.budget as u64;
        let mut candidate = align_up(self.base, alignment);
        for (start, stop) in taken {
            if candidate + size as u64 <= start {
                break;
            }
            candidate = candidate.max(align_up(stop, alignment));
        }

        if candidate + size as u64 > end {
            return Err(Error::ResourceExhausted(format!(
                "reserved window cannot fit {} bytes ({} of {} in use)",
                size,
                live.values().map(|(len, _)| *len).sum::<usize>(),
                self.budget
            )));
        }

        let memory = DmaMemory::zeroed(size);
        live.insert(candidate, (size, memory.clone()));
        debug!("Reserved {} bytes at {:#x}", size, candidate);

        Ok(DmaRegion {
            phys_addr: candidate,
            size,
            memory,
        })
    }

    fn free(&self, region: DmaRegion) {
        if self.lock().remove(&region.phys_addr).is_none() {
            warn!("Free of unknown reserved region {:#x}", region.phys_addr);
        }
    }

    fn lookup(&self, phys_addr: u64) -> Option<DmaMemory> {
        self.lock().get(&phys_addr).map(|(_, memory)| memory.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alignment_and_lookup() {
        let alloc = HeapAllocator::new();
        let a = alloc.allocate(100, DMA_ALIGNMENT).unwrap();
        let b = alloc.allocate(100, DMA_ALIGNMENT).unwrap();
        assert_eq!(a.phys_addr() % DMA_ALIGNMENT as u64, 0);
        assert_eq!(b.phys_addr() % DMA_ALIGNMENT as u64, 0);
        assert!(b.phys_addr() >= a.phys_addr() + 100);

        a.memory().lock()[0] = 0xAB;
        let view = alloc.lookup(a.phys_addr()).unwrap();
        assert_eq!(view.lock()[0], 0xAB);

        alloc.free(a);
        assert_eq!(alloc.live_regions(), 1);
        alloc.free(b);
        assert_eq!(alloc.live_regions(), 0);
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let alloc = HeapAllocator::new();
        assert!(matches!(
            alloc.allocate(64, 48),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            alloc.allocate(0, 64),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_reserved_window_exhaustion_and_reuse() {
        let alloc = ReservedRegionAllocator::new(0x8000_0000, 64 * 1024);
        let first = alloc.allocate(32 * 1024, DMA_ALIGNMENT).unwrap();
        let second = alloc.allocate(32 * 1024, DMA_ALIGNMENT).unwrap();
        assert_eq!(alloc.used(), 64 * 1024);
        assert!(matches!(
            alloc.allocate(1, DMA_ALIGNMENT),
            Err(Error::ResourceExhausted(_))
        ));

        let first_addr = first.phys_addr();
        alloc.free(first);
        let again = alloc.allocate(16 * 1024, DMA_ALIGNMENT).unwrap();
        assert_eq!(again.phys_addr(), first_addr);

        alloc.free(again);
        alloc.free(second);
        assert_eq!(alloc.used(), 0);
    }
}
