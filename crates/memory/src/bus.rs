use std::ops::Range;

use thiserror::Error;

/// A device model reachable through a window of guest physical address space.
///
/// `offset` is relative to the start of the window the handler was mapped at. `size` is the access
/// width in bytes; values are little-endian and only the low `size` bytes are significant.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);

    /// Access widths and alignment this window accepts. The bus rejects anything else before the
    /// handler sees it.
    fn access_constraints(&self) -> AccessConstraints {
        AccessConstraints::ANY
    }

    /// Return the device to its power-on state.
    fn reset(&mut self) {}
}

/// Valid access shapes for an MMIO window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConstraints {
    pub min_size: usize,
    pub max_size: usize,
    /// Whether accesses that are not naturally aligned to their size are allowed.
    pub unaligned: bool,
}

impl AccessConstraints {
    pub const ANY: Self = Self {
        min_size: 1,
        max_size: 8,
        unaligned: true,
    };

    /// Exactly `size`-byte, naturally aligned accesses only.
    pub const fn fixed(size: usize) -> Self {
        Self {
            min_size: size,
            max_size: size,
            unaligned: false,
        }
    }

    pub fn permits(&self, offset: u64, size: usize) -> bool {
        if size == 0 || size < self.min_size || size > self.max_size {
            return false;
        }
        self.unaligned || offset % size as u64 == 0
    }
}

impl Default for AccessConstraints {
    fn default() -> Self {
        Self::ANY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("MMIO region at {base:#x} has zero length")]
    EmptyRegion { base: u64 },
    #[error("MMIO region {base:#x}+{len:#x} overflows the physical address space")]
    AddressOverflow { base: u64, len: u64 },
    #[error(
        "MMIO region {base:#x}+{len:#x} overlaps existing region {existing_base:#x}+{existing_len:#x}"
    )]
    Overlap {
        base: u64,
        len: u64,
        existing_base: u64,
        existing_len: u64,
    },
}

struct MmioRegion {
    base: u64,
    len: u64,
    handler: Box<dyn MmioHandler>,
}

impl MmioRegion {
    fn end(&self) -> u64 {
        // Overflow is rejected at map time.
        self.base + self.len
    }

    fn contains(&self, paddr: u64) -> bool {
        paddr >= self.base && paddr < self.end()
    }
}

/// Physical address router for MMIO windows.
///
/// Regions are kept sorted by base address and never overlap. The bus is driven synchronously by
/// a single owner (the CPU/machine loop); handlers therefore take `&mut self` and need no locking.
#[derive(Default)]
pub struct MmioBus {
    regions: Vec<MmioRegion>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `handler` at `[base, base + len)`.
    pub fn map_mmio(
        &mut self,
        base: u64,
        len: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MapError> {
        if len == 0 {
            return Err(MapError::EmptyRegion { base });
        }
        let end = base
            .checked_add(len)
            .ok_or(MapError::AddressOverflow { base, len })?;

        if let Some(existing) = self
            .regions
            .iter()
            .find(|r| base < r.end() && r.base < end)
        {
            return Err(MapError::Overlap {
                base,
                len,
                existing_base: existing.base,
                existing_len: existing.len,
            });
        }

        let idx = self.regions.partition_point(|r| r.base < base);
        self.regions.insert(idx, MmioRegion { base, len, handler });
        tracing::debug!("mapped MMIO region {base:#x}..{end:#x}");
        Ok(())
    }

    /// Mapped windows in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.regions.iter().map(|r| r.base..r.end())
    }

    pub fn is_mapped(&self, paddr: u64) -> bool {
        self.find(paddr).is_some()
    }

    pub fn read(&mut self, paddr: u64, size: usize) -> u64 {
        if size == 0 {
            return 0;
        }

        let Some(idx) = self.find(paddr) else {
            tracing::warn!(
                target: "guest_error",
                "read from unmapped physical address {paddr:#x} (size {size})"
            );
            return size_mask(size);
        };

        let region = &mut self.regions[idx];
        let offset = paddr - region.base;
        if !region.handler.access_constraints().permits(offset, size) {
            tracing::warn!(
                target: "guest_error",
                "rejected {size}-byte read at {paddr:#x} (window offset {offset:#x})"
            );
            return 0;
        }

        region.handler.read(offset, size) & size_mask(size)
    }

    pub fn write(&mut self, paddr: u64, size: usize, value: u64) {
        if size == 0 {
            return;
        }

        let Some(idx) = self.find(paddr) else {
            tracing::warn!(
                target: "guest_error",
                "write of {value:#x} to unmapped physical address {paddr:#x} (size {size})"
            );
            return;
        };

        let region = &mut self.regions[idx];
        let offset = paddr - region.base;
        if !region.handler.access_constraints().permits(offset, size) {
            tracing::warn!(
                target: "guest_error",
                "rejected {size}-byte write at {paddr:#x} (window offset {offset:#x})"
            );
            return;
        }

        region.handler.write(offset, size, value & size_mask(size));
    }

    pub fn read_u32(&mut self, paddr: u64) -> u32 {
        self.read(paddr, 4) as u32
    }

    pub fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write(paddr, 4, u64::from(value));
    }

    /// Reset every mapped device. Mappings are kept.
    pub fn reset(&mut self) {
        for region in &mut self.regions {
            region.handler.reset();
        }
    }

    fn find(&self, paddr: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.base <= paddr);
        let idx = idx.checked_sub(1)?;
        self.regions[idx].contains(paddr).then_some(idx)
    }
}

/// All-ones value for a `size`-byte access; doubles as the open-bus read value.
fn size_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}
