use core::fmt;

/// Location of the checkpoint record: the first sector of block 0. The entire
/// first block is reserved and never receives test patterns.
pub const CHECKPOINT_ADDR: u32 = 0x0000_0000;
/// "FLAS" in ASCII
pub const CHECKPOINT_MAGIC: u32 = 0x464C_4153;
/// version 2 adds the CRC trailer; version 1 records are not accepted
pub const CHECKPOINT_VERSION: u16 = 0x0002;

/// Rated P/E cycles of the part; telomere progress is measured against this (100% = rated life).
pub const RATED_PE_CYCLES: u32 = 100_000;

// hard end-of-life criteria
pub const EOL_ERASE_TIME_PER_BLOCK_MS: f32 = 500.0;
/// used in place of the per-block budget when the block count is unknown
pub const EOL_CHIP_ERASE_TIME_MS: f32 = 120_000.0;
pub const EOL_BAD_BLOCK_RATE_PERCENT: f32 = 5.0;
pub const EOL_ERASE_FAIL_COUNT: u32 = 3;
pub const EOL_PROGRAM_FAIL_COUNT: u32 = 10;
pub const EOL_READ_DISTURB_THRESHOLD: u32 = 10;

// soft classification, in percent degradation against the baseline
pub const DEGRADATION_WARNING_RATE: f32 = 30.0;
pub const DEGRADATION_DANGER_RATE: f32 = 50.0;

/// bit error budgets for the various reliability classes
pub const ERROR_RATE_CONSUMER: f32 = 1e-3;
pub const ERROR_RATE_INDUSTRIAL: f32 = 1e-4;
pub const ERROR_RATE_AUTOMOTIVE: f32 = 1e-6;
pub const ERROR_RATE_HIGH_RELIABILITY: f32 = 1e-9;

/// a page with more than this many (non-injected) bit errors marks its block as bad for the cycle
pub const BAD_PAGE_BIT_ERRORS: u32 = 8;
/// number of re-reads of the probe sector during a deep health check
pub const READ_DISTURB_PASSES: u32 = 8;

// wait-ready budgets
pub const ERASE_TIMEOUT_PER_BLOCK_MS: u32 = 200 * 3;
pub const ERASE_TIMEOUT_MIN_MS: u32 = 60_000;
pub const ERASE_TIMEOUT_MAX_MS: u32 = 600_000;
pub const PROGRAM_TIMEOUT_MS: u32 = 2_000;
pub const SECTOR_ERASE_TIMEOUT_MS: u32 = 2_000;
/// datasheet typical for one 64 KiB block erase, used for the expected chip erase time
pub const TYPICAL_BLOCK_ERASE_MS: f32 = 150.0;
/// `run` gives up after this many cycles in a row end in a timeout
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// the value an injected fault writes in place of the fill byte
pub const FAULT_SENTINEL: u8 = 0xFF;
pub const MAX_FAULT_COUNT: u32 = 10;

pub const DEFAULT_DEEP_CHECK_INTERVAL: u32 = 1000;
pub const DEFAULT_LOG_INTERVAL: u32 = 100;
pub const DEFAULT_CONSECUTIVE_ERASE: u32 = 1;
pub const MAX_CONSECUTIVE_ERASE: u32 = 100;
pub const DEFAULT_FAULT_COUNT: u32 = 5;
pub const DEFAULT_FAULT_SEED: u64 = 0x464C_4153_5345_4544;

#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ChipStatus {
    Normal = 0,
    /// performance has degraded past the warning threshold
    Warning = 1,
    /// close to end of life
    Danger = 2,
    Dead = 3,
}
impl Default for ChipStatus {
    fn default() -> Self { ChipStatus::Normal }
}

#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TestStatus {
    Running = 0,
    /// the chip has been declared dead
    Completed = 1,
    Paused = 2,
}

#[derive(num_derive::FromPrimitive, num_derive::ToPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnduranceError {
    /// an operation was attempted before `init()`
    NotInitialized,
    InvalidArgument,
    /// the device returned a failure status
    StorageFailed,
    /// wait-ready exceeded its budget
    Timeout,
    /// terminal: the chip has reached end of life
    ChipDead,
}

impl fmt::Display for EnduranceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use EnduranceError::*;
        match self {
            NotInitialized => write!(f, "endurance test not initialized"),
            InvalidArgument => write!(f, "invalid argument"),
            StorageFailed => write!(f, "flash operation failed"),
            Timeout => write!(f, "timed out waiting for flash to become ready"),
            ChipDead => write!(f, "chip has reached end of life"),
        }
    }
}

#[cfg(not(target_os = "none"))]
impl std::error::Error for EnduranceError {}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Config {
    /// run a deep health check every N cycles
    pub deep_check_interval: u32,
    /// emit a progress report every N cycles
    pub log_interval: u32,
    pub verbose: bool,
    /// number of full-chip erases per write+verify pass (1..=100)
    pub consecutive_erase_count: u32,
    /// diagnostic only: corrupt a few bytes on purpose to prove the verify path works
    pub simulate_fault_enabled: bool,
    pub simulate_fault_count: u32,
    pub fault_seed: u64,
    /// EOL when the per-cycle bit error rate exceeds this fraction
    pub error_rate_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            deep_check_interval: DEFAULT_DEEP_CHECK_INTERVAL,
            log_interval: DEFAULT_LOG_INTERVAL,
            verbose: false,
            consecutive_erase_count: DEFAULT_CONSECUTIVE_ERASE,
            simulate_fault_enabled: false,
            simulate_fault_count: DEFAULT_FAULT_COUNT,
            fault_seed: DEFAULT_FAULT_SEED,
            error_rate_threshold: ERROR_RATE_CONSUMER,
        }
    }
}

impl Config {
    /// Returns a copy with zero or out-of-range fields replaced by their defaults.
    pub fn validated(&self) -> Config {
        let mut c = *self;
        if c.deep_check_interval == 0 {
            log::warn!(target: "endurance", "deep_check_interval of 0 replaced with {}", DEFAULT_DEEP_CHECK_INTERVAL);
            c.deep_check_interval = DEFAULT_DEEP_CHECK_INTERVAL;
        }
        if c.log_interval == 0 {
            log::warn!(target: "endurance", "log_interval of 0 replaced with {}", DEFAULT_LOG_INTERVAL);
            c.log_interval = DEFAULT_LOG_INTERVAL;
        }
        if c.consecutive_erase_count == 0 || c.consecutive_erase_count > MAX_CONSECUTIVE_ERASE {
            log::warn!(
                target: "endurance",
                "consecutive_erase_count {} out of range 1..={}, using {}",
                c.consecutive_erase_count,
                MAX_CONSECUTIVE_ERASE,
                DEFAULT_CONSECUTIVE_ERASE
            );
            c.consecutive_erase_count = DEFAULT_CONSECUTIVE_ERASE;
        }
        if c.simulate_fault_count == 0 || c.simulate_fault_count > MAX_FAULT_COUNT {
            if c.simulate_fault_enabled {
                log::warn!(
                    target: "endurance",
                    "simulate_fault_count {} out of range 1..={}, using {}",
                    c.simulate_fault_count,
                    MAX_FAULT_COUNT,
                    DEFAULT_FAULT_COUNT
                );
            }
            c.simulate_fault_count = DEFAULT_FAULT_COUNT;
        }
        if !c.error_rate_threshold.is_finite() || c.error_rate_threshold <= 0.0 || c.error_rate_threshold >= 1.0 {
            log::warn!(
                target: "endurance",
                "error_rate_threshold {:e} invalid, using {:e}",
                c.error_rate_threshold,
                ERROR_RATE_CONSUMER
            );
            c.error_rate_threshold = ERROR_RATE_CONSUMER;
        }
        c
    }
}

/// Metrics of the first completed cycle. Written once per test lifetime.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Baseline {
    /// full-chip erase time, ms
    pub erase_time_avg: f32,
    /// page program time, ms
    pub program_time_avg: f32,
    /// KiB/s
    pub read_speed: f32,
    pub error_rate: f32,
    /// reserved for the device unique ID; not read by the engine
    pub unique_id: u64,
}
impl Baseline {
    /// the "still zero" guard: true until the first cycle's metrics land here
    pub fn is_unset(&self) -> bool {
        self.erase_time_avg == 0.0 && self.program_time_avg == 0.0 && self.read_speed == 0.0 && self.error_rate == 0.0
    }
}

/// Final metrics, captured when end of life is declared.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct DeadData {
    pub dead_cycle: u32,
    pub erase_time_final: f32,
    pub program_time_final: f32,
    pub read_speed_final: f32,
    pub erase_errors_final: u32,
    pub program_errors_final: u32,
    pub verify_errors_final: u64,
    pub bad_block_count_final: u32,
    pub error_rate_final: f32,
    pub telomere_progress_final: f32,
    pub chip_status_final: ChipStatus,
    pub total_bytes_written_final: u64,
}

impl DeadData {
    pub fn capture(result: &TestResult) -> DeadData {
        DeadData {
            dead_cycle: result.total_cycles,
            erase_time_final: result.erase_time_current,
            program_time_final: result.program_time_avg,
            read_speed_final: result.read_speed,
            erase_errors_final: result.erase_errors,
            program_errors_final: result.program_errors,
            verify_errors_final: result.verify_errors,
            bad_block_count_final: result.bad_block_count,
            error_rate_final: result.error_rate,
            telomere_progress_final: result.telomere_progress,
            chip_status_final: result.chip_status,
            total_bytes_written_final: result.total_bytes_written,
        }
    }
}

/// Cumulative state of one test run.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct TestResult {
    pub total_cycles: u32,
    pub current_cycle: u32,
    /// write+verify passes; the sample count for the program/read running means
    pub verify_passes: u32,
    pub total_bytes_written: u64,

    // erase times are full-chip, in ms
    pub erase_time_avg: f32,
    pub erase_time_current: f32,
    pub erase_time_min: f32,
    pub erase_time_max: f32,
    /// ms per page
    pub program_time_avg: f32,
    /// KiB/s
    pub read_speed: f32,

    pub erase_errors: u32,
    pub program_errors: u32,
    /// cumulative bit errors
    pub verify_errors: u64,
    pub bad_block_count: u32,
    pub read_disturb_errors: u32,
    /// bit errors over bits read, for the most recent verify pass
    pub error_rate: f32,

    // percent, never negative
    pub erase_degradation_rate: f32,
    pub program_degradation_rate: f32,
    pub read_speed_degradation_rate: f32,

    pub chip_status: ChipStatus,
    /// percent of rated life consumed; may exceed 100
    pub telomere_progress: f32,

    pub baseline: Baseline,
    pub baseline_recorded: bool,
    pub chip_dead: bool,
}

impl TestResult {
    pub fn new() -> TestResult { TestResult::default() }

    pub fn total_mb_written(&self) -> u64 { self.total_bytes_written / (1024 * 1024) }

    pub(crate) fn declare_dead(&mut self) {
        self.chip_dead = true;
        self.chip_status = ChipStatus::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let bad = Config {
            deep_check_interval: 0,
            log_interval: 0,
            verbose: true,
            consecutive_erase_count: 101,
            simulate_fault_enabled: true,
            simulate_fault_count: 11,
            fault_seed: 7,
            error_rate_threshold: f32::NAN,
        };
        let good = bad.validated();
        assert_eq!(good.deep_check_interval, DEFAULT_DEEP_CHECK_INTERVAL);
        assert_eq!(good.log_interval, DEFAULT_LOG_INTERVAL);
        assert_eq!(good.consecutive_erase_count, DEFAULT_CONSECUTIVE_ERASE);
        assert_eq!(good.simulate_fault_count, DEFAULT_FAULT_COUNT);
        assert_eq!(good.error_rate_threshold, ERROR_RATE_CONSUMER);
        // untouched fields survive
        assert!(good.verbose);
        assert_eq!(good.fault_seed, 7);

        let fine = Config { consecutive_erase_count: 100, simulate_fault_count: 10, error_rate_threshold: ERROR_RATE_AUTOMOTIVE, ..Default::default() };
        assert_eq!(fine.validated(), fine);
        assert_eq!(Config { error_rate_threshold: 1.0, ..Default::default() }.validated().error_rate_threshold, ERROR_RATE_CONSUMER);
    }

    #[test]
    fn test_baseline_guard() {
        let mut b = Baseline::default();
        assert!(b.is_unset());
        b.read_speed = 1.0;
        assert!(!b.is_unset());
    }
}
