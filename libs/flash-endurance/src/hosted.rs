//! A RAM-backed NOR flash for host tools and tests.
//!
//! Program operations can only clear bits, erases set them, and every operation
//! advances a simulated clock by a modeled latency. Past an optional rated cycle
//! count the data area wears out: bits start sticking at 1 and chip erases slow
//! down. The reserved checkpoint block is modeled as healthy.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::storage::{Clock, DeviceInfo, FlashDevice, FlashError};

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<u64>>,
}
impl SimClock {
    pub fn new() -> Self { SimClock { now: Rc::new(Cell::new(0)) } }

    pub fn advance_us(&self, us: u64) { self.now.set(self.now.get() + us); }
}
impl Clock for SimClock {
    fn now_us(&self) -> u64 { self.now.get() }
}

/// Wall-clock time, for driving real hardware from a host.
#[cfg(not(target_os = "none"))]
pub struct SystemClock {
    start: std::time::Instant,
}
#[cfg(not(target_os = "none"))]
impl SystemClock {
    pub fn new() -> Self { SystemClock { start: std::time::Instant::now() } }
}
#[cfg(not(target_os = "none"))]
impl Default for SystemClock {
    fn default() -> Self { SystemClock::new() }
}
#[cfg(not(target_os = "none"))]
impl Clock for SystemClock {
    fn now_us(&self) -> u64 { self.start.elapsed().as_micros() as u64 }
}

/// Modeled operation latencies, in microseconds.
#[derive(Debug, Copy, Clone)]
pub struct Timing {
    pub block_erase_us: u64,
    pub sector_erase_us: u64,
    pub page_program_us: u64,
    pub page_read_us: u64,
    /// fractional chip-erase slowdown per cycle past the rated count
    pub erase_slowdown_per_cycle: f32,
    /// fractional chip-erase slowdown per erase, regardless of wear
    pub erase_growth_per_erase: f32,
}
impl Default for Timing {
    fn default() -> Self {
        Timing {
            block_erase_us: 150_000,
            sector_erase_us: 45_000,
            page_program_us: 700,
            page_read_us: 100,
            erase_slowdown_per_cycle: 0.02,
            erase_growth_per_erase: 0.0,
        }
    }
}

/// Bytes out of every 4096 that grow a stuck bit, per cycle past the rated count.
pub const STUCK_BYTES_PER_CYCLE: u32 = 4;

struct Disturb {
    addr: u32,
    mask: u8,
    reads_left: u32,
}

pub struct EmuFlash {
    info: DeviceInfo,
    memory: Vec<u8>,
    clock: SimClock,
    timing: Timing,
    rated_cycles: Option<u32>,

    chip_erases: u32,
    sector_erases: u32,
    page_writes: u32,
    page_reads: u32,

    fail_chip_erases: u32,
    fail_programs: u32,
    fail_reads: u32,
    timeout_waits: u32,
    timeout_skip: u32,
    write_budget: Option<u32>,
    powered: bool,
    disturb: Option<Disturb>,
}

impl EmuFlash {
    /// 256 KiB: four 64 KiB blocks, 4 KiB sectors, 256 byte pages.
    pub fn small_geometry() -> DeviceInfo {
        DeviceInfo { capacity: 256 * 1024, page_size: 256, sector_size: 4096, block_size: 65536 }
    }

    pub fn new(info: DeviceInfo, clock: SimClock) -> Self {
        let memory = vec![0xFFu8; info.capacity as usize];
        EmuFlash::from_image(info, clock, memory)
    }

    /// Rebuild a part from a previously exported image, e.g. after a simulated power cycle.
    pub fn from_image(info: DeviceInfo, clock: SimClock, mut memory: Vec<u8>) -> Self {
        memory.resize(info.capacity as usize, 0xFF);
        EmuFlash {
            info,
            memory,
            clock,
            timing: Timing::default(),
            rated_cycles: None,
            chip_erases: 0,
            sector_erases: 0,
            page_writes: 0,
            page_reads: 0,
            fail_chip_erases: 0,
            fail_programs: 0,
            fail_reads: 0,
            timeout_waits: 0,
            timeout_skip: 0,
            write_budget: None,
            powered: true,
            disturb: None,
        }
    }

    /// Enable the wear model: the data area degrades once `rated` chip erases have been done.
    pub fn with_wear(mut self, rated: u32) -> Self {
        self.rated_cycles = Some(rated);
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Continue the wear history of a part restored from an image.
    pub fn set_chip_erases(&mut self, count: u32) { self.chip_erases = count; }

    pub fn image(&self) -> &[u8] { &self.memory }

    pub fn into_image(self) -> Vec<u8> { self.memory }

    pub fn read_range(&self, addr: u32, len: usize) -> Vec<u8> { self.memory[addr as usize..addr as usize + len].to_vec() }

    pub fn chip_erases(&self) -> u32 { self.chip_erases }

    pub fn sector_erases(&self) -> u32 { self.sector_erases }

    pub fn page_writes(&self) -> u32 { self.page_writes }

    pub fn page_reads(&self) -> u32 { self.page_reads }

    // failure hooks
    pub fn fail_next_chip_erases(&mut self, n: u32) { self.fail_chip_erases = n; }

    /// Fail the next `n` page programs outside the reserved block.
    pub fn fail_next_data_programs(&mut self, n: u32) { self.fail_programs = n; }

    /// Fail the next `n` reads that start outside the reserved block.
    pub fn fail_next_data_reads(&mut self, n: u32) { self.fail_reads = n; }

    pub fn timeout_next_waits(&mut self, n: u32) { self.timeout_waits_after(0, n); }

    /// Let `skip` more waits finish, then time out the `n` after them.
    pub fn timeout_waits_after(&mut self, skip: u32, n: u32) {
        self.timeout_skip = skip;
        self.timeout_waits = n;
    }

    /// After `n` more successful page programs the part loses power: every operation fails
    /// and nothing changes until `restore_power`.
    pub fn cut_power_after_writes(&mut self, n: u32) { self.write_budget = Some(n); }

    pub fn restore_power(&mut self) {
        self.write_budget = None;
        self.powered = true;
    }

    /// Flip `mask` in the byte at `addr` once it has been read `reads` times.
    pub fn disturb_after_reads(&mut self, addr: u32, mask: u8, reads: u32) {
        self.disturb = Some(Disturb { addr, mask, reads_left: reads });
    }

    fn excess_cycles(&self) -> u32 {
        match self.rated_cycles {
            Some(rated) => self.chip_erases.saturating_sub(rated),
            None => 0,
        }
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::Failed);
        }
        if addr as usize + len > self.memory.len() {
            log::error!("emulated access out of range: {:08x}+{}", addr, len);
            return Err(FlashError::Failed);
        }
        Ok(())
    }

    /// Deterministic per-address hash used to place stuck bits.
    fn mix(addr: u32) -> u32 {
        let mut x = addr.wrapping_mul(0x9E37_79B9);
        x ^= x >> 15;
        x = x.wrapping_mul(0x85EB_CA6B);
        x ^ (x >> 13)
    }

    fn stuck_mask(&self, addr: u32) -> u8 {
        let excess = self.excess_cycles();
        if excess == 0 || self.info.is_reserved(addr) {
            return 0;
        }
        let h = EmuFlash::mix(addr);
        if h % 4096 < excess.saturating_mul(STUCK_BYTES_PER_CYCLE) {
            1 << ((h >> 12) & 7)
        } else {
            0
        }
    }
}

impl FlashDevice for EmuFlash {
    fn device_info(&self) -> DeviceInfo { self.info }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(addr, buf.len())?;
        if self.fail_reads > 0 && !self.info.is_reserved(addr) {
            self.fail_reads -= 1;
            return Err(FlashError::Failed);
        }
        let start = addr as usize;
        buf.copy_from_slice(&self.memory[start..start + buf.len()]);
        if let Some(d) = self.disturb.as_mut() {
            if d.addr >= addr && (d.addr as usize) < start + buf.len() {
                d.reads_left = d.reads_left.saturating_sub(1);
                if d.reads_left == 0 {
                    self.memory[d.addr as usize] ^= d.mask;
                    self.disturb = None;
                }
            }
        }
        self.page_reads += 1;
        let pages = ((buf.len() as u64 + self.info.page_size as u64 - 1) / self.info.page_size as u64).max(1);
        self.clock.advance_us(pages * self.timing.page_read_us);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_range(addr, data.len())?;
        let page = self.info.page_size;
        if data.is_empty() || (addr % page) as usize + data.len() > page as usize {
            log::error!("emulated program crosses a page boundary: {:08x}+{}", addr, data.len());
            return Err(FlashError::Failed);
        }
        if let Some(budget) = self.write_budget {
            if budget == 0 {
                self.powered = false;
                return Err(FlashError::Failed);
            }
            self.write_budget = Some(budget - 1);
        }
        if self.fail_programs > 0 && !self.info.is_reserved(addr) {
            self.fail_programs -= 1;
            return Err(FlashError::Failed);
        }
        for (i, &src) in data.iter().enumerate() {
            let a = addr + i as u32;
            let stuck = self.stuck_mask(a);
            self.memory[a as usize] &= src | stuck;
        }
        self.page_writes += 1;
        self.clock.advance_us(self.timing.page_program_us);
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        self.check_range(addr, 1)?;
        let size = self.info.sector_size as usize;
        let start = addr as usize & !(size - 1);
        for b in self.memory[start..start + size].iter_mut() {
            *b = 0xFF;
        }
        self.sector_erases += 1;
        self.clock.advance_us(self.timing.sector_erase_us);
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        self.check_range(0, 0)?;
        if self.fail_chip_erases > 0 {
            self.fail_chip_erases -= 1;
            return Err(FlashError::Failed);
        }
        for b in self.memory.iter_mut() {
            *b = 0xFF;
        }
        let slowdown = (1.0 + self.excess_cycles() as f32 * self.timing.erase_slowdown_per_cycle)
            * (1.0 + self.chip_erases as f32 * self.timing.erase_growth_per_erase);
        let us = (self.info.total_blocks() as u64 * self.timing.block_erase_us) as f32 * slowdown;
        self.chip_erases += 1;
        self.clock.advance_us(us as u64);
        Ok(())
    }

    fn wait_ready(&mut self, _timeout_ms: u32) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::Failed);
        }
        if self.timeout_skip > 0 {
            self.timeout_skip -= 1;
        } else if self.timeout_waits > 0 {
            self.timeout_waits -= 1;
            return Err(FlashError::Timeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nor_semantics() {
        let clock = SimClock::new();
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), clock.clone());
        flash.write(0x1_0000, &[0xF0, 0x0F]).unwrap();
        flash.write(0x1_0000, &[0x3C, 0xFF]).unwrap();
        // programming only clears bits
        assert_eq!(flash.read_range(0x1_0000, 2), vec![0x30, 0x0F]);
        assert!(clock.now_us() > 0);
        // crossing a page boundary is refused
        assert_eq!(flash.write(0x1_00FF, &[0, 0]), Err(FlashError::Failed));
        flash.erase_sector(0x1_0010).unwrap();
        assert_eq!(flash.read_range(0x1_0000, 2), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_wear_model() {
        let info = EmuFlash::small_geometry();
        let mut flash = EmuFlash::new(info, SimClock::new()).with_wear(2);
        let zeros = [0u8; 256];
        for _ in 0..2 {
            flash.erase_chip().unwrap();
        }
        flash.write(0x1_0000, &zeros).unwrap();
        assert!(flash.read_range(0x1_0000, 256).iter().all(|&b| b == 0));

        for _ in 0..40 {
            flash.erase_chip().unwrap();
        }
        let mut stuck = 0;
        for page in (info.data_start()..info.capacity).step_by(256) {
            flash.write(page, &zeros).unwrap();
            stuck += flash.read_range(page, 256).iter().filter(|&&b| b != 0).count();
        }
        assert!(stuck > 0, "a worn part should show stuck bits");
        // the reserved block stays healthy
        flash.write(0, &zeros).unwrap();
        assert!(flash.read_range(0, 256).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failure_hooks() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        flash.fail_next_chip_erases(1);
        assert_eq!(flash.erase_chip(), Err(FlashError::Failed));
        assert!(flash.erase_chip().is_ok());
        flash.timeout_next_waits(1);
        assert_eq!(flash.wait_ready(10), Err(FlashError::Timeout));
        assert!(flash.wait_ready(10).is_ok());
        flash.timeout_waits_after(2, 1);
        assert!(flash.wait_ready(10).is_ok());
        assert!(flash.wait_ready(10).is_ok());
        assert_eq!(flash.wait_ready(10), Err(FlashError::Timeout));
        assert!(flash.wait_ready(10).is_ok());

        flash.cut_power_after_writes(1);
        assert!(flash.write(0x1_0000, &[0]).is_ok());
        assert!(flash.write(0x1_0001, &[0]).is_err());
        let mut buf = [0u8; 1];
        assert!(flash.read(0x1_0001, &mut buf).is_err());
        flash.restore_power();
        flash.read(0x1_0001, &mut buf).unwrap();
        assert_eq!(buf[0], 0xFF);

        flash.write(0x2_0000, &[0x00]).unwrap();
        flash.disturb_after_reads(0x2_0000, 0x04, 2);
        flash.read(0x2_0000, &mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
        flash.read(0x2_0000, &mut buf).unwrap();
        flash.read(0x2_0000, &mut buf).unwrap();
        assert_eq!(buf[0], 0x04);
    }
}
