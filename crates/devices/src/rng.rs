//! STM32L4R5 true random number generator (RNG).
//!
//! The peripheral exposes three 32-bit registers through a 12-byte MMIO window:
//!
//! | Offset | Register | Access                                            |
//! |--------|----------|---------------------------------------------------|
//! | `0x0`  | CR       | R/W, bit 2 (`RNGEN`) enables the generator        |
//! | `0x4`  | SR       | bit 0 (`DRDY`) read-only, bits 5/6 cleared by 0   |
//! | `0x8`  | DR       | read-only, one fresh random word per read         |
//!
//! Enabling is instantaneous: `DRDY` follows `RNGEN` on every CR write. `DRDY` is not consumed by
//! a DR read, so an enabled generator yields an unbounded stream of words.
//!
//! Guest mistakes (bad offsets, reads while not ready, writes to read-only state) never fault the
//! machine. They are logged under the `guest_error` target and answered with 0 / ignored.

use std::ops::Range;

use memory::{AccessConstraints, MapError, MmioBus, MmioHandler};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use thiserror::Error;

/// RNG base address on the STM32L4R5 AHB2 bus.
pub const RNG_MMIO_BASE: u64 = 0x5006_0800;
pub const RNG_REGS_NUM: usize = 3;
pub const RNG_MMIO_SIZE: u64 = 4 * RNG_REGS_NUM as u64;

pub const RNG_CR: u64 = 0x0;
pub const RNG_SR: u64 = 0x4;
pub const RNG_DR: u64 = 0x8;

pub const CR_RNGEN: u32 = 1 << 2;

pub const SR_DRDY: u32 = 1 << 0;
pub const SR_CECS: u32 = 1 << 1;
pub const SR_SECS: u32 = 1 << 2;
pub const SR_CEIS: u32 = 1 << 5;
pub const SR_SEIS: u32 = 1 << 6;

const SR_READ_ONLY: u32 = SR_DRDY | SR_CECS | SR_SECS;
const SR_STICKY: u32 = SR_CEIS | SR_SEIS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngRegister {
    Cr = 0,
    Sr = 1,
    Dr = 2,
}

impl RngRegister {
    /// Decode a window offset. Registers are 32 bits wide, so the low two bits are ignored.
    pub fn from_offset(offset: u64) -> Option<Self> {
        match offset / 4 {
            0 => Some(Self::Cr),
            1 => Some(Self::Sr),
            2 => Some(Self::Dr),
            _ => None,
        }
    }

    pub const fn offset(self) -> u64 {
        self as u64 * 4
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Guest-visible misuse of the RNG register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RngGuestError {
    #[error("out-of-bounds read at offset {offset:#06x}")]
    ReadOutOfBounds { offset: u64 },
    #[error("out-of-bounds write at offset {offset:#06x}")]
    WriteOutOfBounds { offset: u64 },
    #[error("read from invalid offset {offset:#x}")]
    InvalidRead { offset: u64 },
    #[error("write to invalid offset {offset:#x}")]
    InvalidWrite { offset: u64 },
    #[error("no valid data available in DR register")]
    DataNotReady,
    #[error("write to read-only register @ {offset:#x}")]
    ReadOnlyWrite { offset: u64 },
    #[error("SR write with read-only bits set ({value:#x}), this might be a guest bug")]
    StatusReadOnlyBits { value: u32 },
}

impl RngGuestError {
    /// Window offset the offending access targeted.
    pub fn offset(&self) -> u64 {
        match *self {
            Self::ReadOutOfBounds { offset }
            | Self::WriteOutOfBounds { offset }
            | Self::InvalidRead { offset }
            | Self::InvalidWrite { offset }
            | Self::ReadOnlyWrite { offset } => offset,
            Self::DataNotReady => RNG_DR,
            Self::StatusReadOnlyBits { .. } => RNG_SR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngConfig {
    /// Identifies the instance in diagnostics.
    pub name: String,
    pub mmio_base: u64,
}

impl Default for RngConfig {
    fn default() -> Self {
        Self {
            name: "stm32l4r5-rng".to_string(),
            mmio_base: RNG_MMIO_BASE,
        }
    }
}

/// SR value after a CR write: `DRDY` mirrors `RNGEN`, every other bit is kept.
pub const fn derive_status(status: u32, control: u32) -> u32 {
    if control & CR_RNGEN != 0 {
        status | SR_DRDY
    } else {
        status & !SR_DRDY
    }
}

/// SR value after a guest SR write. `CEIS`/`SEIS` are cleared where `written` has a 0 and are
/// otherwise left alone; the guest can never set them. No other bit is affected.
pub const fn clear_sticky_flags(status: u32, written: u32) -> u32 {
    status & (!SR_STICKY | written)
}

/// RNG register file plus the entropy source feeding DR.
pub struct Stm32Rng<R = OsRng> {
    name: String,
    regs: [u32; RNG_REGS_NUM],
    entropy: R,
}

impl Stm32Rng<OsRng> {
    /// RNG backed by the host operating system's CSPRNG.
    pub fn new(config: RngConfig) -> Self {
        Self::with_entropy(config, OsRng)
    }
}

impl<R: RngCore + CryptoRng> Stm32Rng<R> {
    pub fn with_entropy(config: RngConfig, entropy: R) -> Self {
        Self {
            name: config.name,
            regs: [0; RNG_REGS_NUM],
            entropy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw register file, indexed by [`RngRegister`]. Reading it has no side effects.
    pub fn regs(&self) -> [u32; RNG_REGS_NUM] {
        self.regs
    }

    pub fn register(&self, reg: RngRegister) -> u32 {
        self.regs[reg.index()]
    }

    pub fn data_ready(&self) -> bool {
        self.regs[RngRegister::Sr.index()] & SR_DRDY != 0
    }

    /// Latch the clock/seed error interrupt flags (`CEIS`, `SEIS`). Other bits of `mask` are
    /// ignored.
    pub fn raise_error_flags(&mut self, mask: u32) {
        self.regs[RngRegister::Sr.index()] |= mask & SR_STICKY;
    }

    pub fn reset(&mut self) {
        self.regs = [0; RNG_REGS_NUM];
    }

    pub fn mmio_read(&mut self, offset: u64, size: usize) -> u32 {
        if offset >= RNG_MMIO_SIZE {
            self.guest_error(RngGuestError::ReadOutOfBounds { offset });
            return 0;
        }

        let value = match RngRegister::from_offset(offset) {
            Some(reg @ (RngRegister::Cr | RngRegister::Sr)) => self.regs[reg.index()],
            Some(RngRegister::Dr) => {
                if self.data_ready() {
                    self.entropy.next_u32()
                } else {
                    self.guest_error(RngGuestError::DataNotReady);
                    0
                }
            }
            None => {
                self.guest_error(RngGuestError::InvalidRead { offset });
                0
            }
        };

        tracing::trace!(device = %self.name, "read {offset:#x} ({size} bytes) -> {value:#010x}");
        value
    }

    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u32) {
        tracing::trace!(device = %self.name, "write {offset:#x} ({size} bytes) <- {value:#010x}");

        if offset >= RNG_MMIO_SIZE {
            self.guest_error(RngGuestError::WriteOutOfBounds { offset });
            return;
        }

        match RngRegister::from_offset(offset) {
            Some(RngRegister::Cr) => {
                self.regs[RngRegister::Cr.index()] = value;
                let sr = &mut self.regs[RngRegister::Sr.index()];
                *sr = derive_status(*sr, value);
            }
            Some(RngRegister::Sr) => {
                if value & SR_READ_ONLY != 0 {
                    self.guest_error(RngGuestError::StatusReadOnlyBits { value });
                }
                let sr = &mut self.regs[RngRegister::Sr.index()];
                *sr = clear_sticky_flags(*sr, value);
            }
            Some(RngRegister::Dr) => {
                self.guest_error(RngGuestError::ReadOnlyWrite { offset });
            }
            None => {
                self.guest_error(RngGuestError::InvalidWrite { offset });
            }
        }
    }

    fn guest_error(&self, err: RngGuestError) {
        tracing::warn!(
            target: "guest_error",
            device = %self.name,
            offset = %format!("{:#x}", err.offset()),
            "{err}"
        );
    }
}

impl<R: RngCore + CryptoRng> MmioHandler for Stm32Rng<R> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        u64::from(self.mmio_read(offset, size))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        self.mmio_write(offset, size, value as u32);
    }

    fn access_constraints(&self) -> AccessConstraints {
        AccessConstraints::fixed(4)
    }

    fn reset(&mut self) {
        Stm32Rng::reset(self);
    }
}

/// Construct an RNG and map it on `bus` at `config.mmio_base`.
///
/// Returns the window in absolute guest physical addresses (`mmio_base..mmio_base + 12`). The
/// device itself only ever sees offsets relative to `mmio_base`; [`RNG_CR`], [`RNG_SR`] and
/// [`RNG_DR`] are those relative offsets.
pub fn register_rng<R>(
    bus: &mut MmioBus,
    config: RngConfig,
    entropy: R,
) -> Result<Range<u64>, MapError>
where
    R: RngCore + CryptoRng + 'static,
{
    let base = config.mmio_base;
    let rng = Stm32Rng::with_entropy(config, entropy);
    bus.map_mmio(base, RNG_MMIO_SIZE, Box::new(rng))?;
    Ok(base..base + RNG_MMIO_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rngen_drives_drdy_and_preserves_other_status_bits() {
        assert_eq!(derive_status(0, CR_RNGEN), SR_DRDY);
        assert_eq!(derive_status(SR_DRDY, 0), 0);
        assert_eq!(derive_status(SR_SEIS | SR_CEIS, CR_RNGEN), SR_SEIS | SR_CEIS | SR_DRDY);
        assert_eq!(derive_status(SR_SEIS | SR_DRDY, !CR_RNGEN), SR_SEIS);
        assert_eq!(derive_status(SR_DRDY, CR_RNGEN), SR_DRDY);
    }

    #[test]
    fn sticky_flags_are_clear_only() {
        let set = SR_SEIS | SR_CEIS;
        assert_eq!(clear_sticky_flags(set, 0), 0);
        assert_eq!(clear_sticky_flags(set, SR_SEIS), SR_SEIS);
        assert_eq!(clear_sticky_flags(set, SR_CEIS), SR_CEIS);
        assert_eq!(clear_sticky_flags(set, set), set);

        // Writing 1s cannot set flags that are currently clear.
        assert_eq!(clear_sticky_flags(0, u32::MAX), 0);

        // DRDY is untouched regardless of the written value.
        assert_eq!(clear_sticky_flags(SR_DRDY | set, 0), SR_DRDY);
        assert_eq!(clear_sticky_flags(SR_DRDY, u32::MAX), SR_DRDY);
    }

    #[test]
    fn offsets_decode_to_word_registers() {
        assert_eq!(RngRegister::from_offset(RNG_CR), Some(RngRegister::Cr));
        assert_eq!(RngRegister::from_offset(RNG_SR), Some(RngRegister::Sr));
        assert_eq!(RngRegister::from_offset(RNG_DR), Some(RngRegister::Dr));
        assert_eq!(RngRegister::from_offset(0xB), Some(RngRegister::Dr));
        assert_eq!(RngRegister::from_offset(RNG_MMIO_SIZE), None);

        for reg in [RngRegister::Cr, RngRegister::Sr, RngRegister::Dr] {
            assert_eq!(RngRegister::from_offset(reg.offset()), Some(reg));
        }
    }

    #[test]
    fn default_config_maps_at_the_ahb2_rng_base() {
        let config = RngConfig::default();
        assert_eq!(config.mmio_base, 0x5006_0800);
        assert_eq!(RNG_MMIO_SIZE, 12);
    }
}
