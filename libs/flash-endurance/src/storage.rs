/// Status of a failed flash primitive. Transport details never leak past this.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashError {
    /// the device returned a non-ok status
    Failed,
    /// the device did not report ready within the budget
    Timeout,
}

impl From<FlashError> for crate::EnduranceError {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::Failed => crate::EnduranceError::StorageFailed,
            FlashError::Timeout => crate::EnduranceError::Timeout,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    /// total bytes
    pub capacity: u32,
    /// smallest programmable unit
    pub page_size: u32,
    /// smallest erasable unit
    pub sector_size: u32,
    /// the granularity of the reserved checkpoint region
    pub block_size: u32,
}

impl DeviceInfo {
    pub fn total_pages(&self) -> u32 { if self.page_size == 0 { 0 } else { self.capacity / self.page_size } }

    pub fn total_blocks(&self) -> u32 { if self.block_size == 0 { 0 } else { self.capacity / self.block_size } }

    /// First address after the reserved checkpoint block; test patterns start here.
    pub fn data_start(&self) -> u32 { crate::CHECKPOINT_ADDR + self.block_size }

    pub fn is_reserved(&self, addr: u32) -> bool {
        addr >= crate::CHECKPOINT_ADDR && addr < self.data_start()
    }

    /// Sanity check the geometry: powers of two, nested units, and room for data past the reserved block.
    pub fn is_valid(&self) -> bool {
        self.page_size != 0
            && self.page_size.is_power_of_two()
            && self.sector_size.is_power_of_two()
            && self.block_size.is_power_of_two()
            && self.sector_size >= self.page_size
            && self.block_size >= self.sector_size
            && self.capacity % self.block_size == 0
            && self.capacity > self.block_size
    }

    /// Wait budget for a full-chip erase: 200ms per block with a 3x safety factor, clamped.
    pub fn chip_erase_timeout_ms(&self) -> u32 {
        let budget = self.total_blocks().saturating_mul(crate::ERASE_TIMEOUT_PER_BLOCK_MS);
        budget.max(crate::ERASE_TIMEOUT_MIN_MS).min(crate::ERASE_TIMEOUT_MAX_MS)
    }

    /// What a healthy part should take for a full-chip erase, ms.
    pub fn expected_chip_erase_ms(&self) -> f32 { self.total_blocks() as f32 * crate::TYPICAL_BLOCK_ERASE_MS }
}

/// The storage primitive the engine drives. Every call blocks; `write` and `erase_*`
/// only start the operation, and completion is observed through `wait_ready`.
pub trait FlashDevice {
    fn device_info(&self) -> DeviceInfo;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program at most one page; `data` must not cross a page boundary.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase the sector containing `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    fn erase_chip(&mut self) -> Result<(), FlashError>;

    fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), FlashError>;
}

/// Monotonic time source used for latency measurements.
pub trait Clock {
    fn now_us(&self) -> u64;

    fn elapsed_ms(&self, start_us: u64) -> f32 { self.now_us().saturating_sub(start_us) as f32 / 1000.0 }
}
