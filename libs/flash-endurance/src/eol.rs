use core::fmt;

use crate::storage::DeviceInfo;
use crate::*;

/// Why a chip was declared dead.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum EolReason {
    /// average full-chip erase time over its budget
    EraseTime { avg_ms: f32, limit_ms: f32 },
    BadBlocks { percent: f32 },
    ErrorRate { rate: f32, threshold: f32 },
    ReadDisturb { count: u32 },
    /// consecutive erase failures, detected by the cycle executor
    EraseFailures(u32),
    /// page program failures within one cycle, detected by the cycle executor
    ProgramFailures(u32),
}

impl fmt::Display for EolReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use EolReason::*;
        match self {
            EraseTime { avg_ms, limit_ms } => write!(f, "erase time {:.1} ms exceeds {:.1} ms", avg_ms, limit_ms),
            BadBlocks { percent } => write!(f, "bad block rate {:.2}% exceeds {:.1}%", percent, EOL_BAD_BLOCK_RATE_PERCENT),
            ErrorRate { rate, threshold } => write!(f, "bit error rate {:e} exceeds {:e}", rate, threshold),
            ReadDisturb { count } => write!(f, "{} read disturb errors exceed {}", count, EOL_READ_DISTURB_THRESHOLD),
            EraseFailures(n) => write!(f, "{} consecutive erase failures", n),
            ProgramFailures(n) => write!(f, "{} program failures in one cycle", n),
        }
    }
}

/// Erase time budget for the whole chip.
pub fn erase_time_limit_ms(info: &DeviceInfo) -> f32 {
    let blocks = info.total_blocks();
    if blocks == 0 { EOL_CHIP_ERASE_TIME_MS } else { blocks as f32 * EOL_ERASE_TIME_PER_BLOCK_MS }
}

pub fn bad_block_percent(result: &TestResult, info: &DeviceInfo) -> f32 {
    let blocks = info.total_blocks();
    if blocks == 0 { 0.0 } else { result.bad_block_count as f32 * 100.0 / blocks as f32 }
}

/// Evaluate the end-of-life criteria in order; the first one that matches is returned.
pub fn eol_reason(result: &TestResult, error_rate_threshold: f32, info: &DeviceInfo) -> Option<EolReason> {
    let limit_ms = erase_time_limit_ms(info);
    if result.erase_time_avg > limit_ms {
        return Some(EolReason::EraseTime { avg_ms: result.erase_time_avg, limit_ms });
    }
    let percent = bad_block_percent(result, info);
    if percent > EOL_BAD_BLOCK_RATE_PERCENT {
        return Some(EolReason::BadBlocks { percent });
    }
    if result.error_rate > error_rate_threshold {
        return Some(EolReason::ErrorRate { rate: result.error_rate, threshold: error_rate_threshold });
    }
    if result.read_disturb_errors > EOL_READ_DISTURB_THRESHOLD {
        return Some(EolReason::ReadDisturb { count: result.read_disturb_errors });
    }
    None
}

/// Apply the end-of-life criteria. A match marks the chip dead; there is no way back.
pub fn check_eol(result: &mut TestResult, error_rate_threshold: f32, info: &DeviceInfo) -> Option<EolReason> {
    if result.chip_dead {
        return None;
    }
    let reason = eol_reason(result, error_rate_threshold, info)?;
    log::warn!(target: "endurance::eol", "cycle {}: end of life, {}", result.total_cycles, reason);
    result.declare_dead();
    Some(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DeviceInfo { DeviceInfo { capacity: 16 * 1024 * 1024, page_size: 256, sector_size: 4096, block_size: 65536 } }

    #[test]
    fn test_error_rate_eol() {
        let mut r = TestResult::new();
        r.error_rate = 2e-3;
        let reason = check_eol(&mut r, 1e-3, &info());
        assert_eq!(reason, Some(EolReason::ErrorRate { rate: 2e-3, threshold: 1e-3 }));
        assert!(r.chip_dead);
        assert_eq!(r.chip_status, ChipStatus::Dead);
        // terminal: a later healthy evaluation doesn't revive it
        r.error_rate = 0.0;
        assert_eq!(check_eol(&mut r, 1e-3, &info()), None);
        assert_eq!(r.chip_status, ChipStatus::Dead);
    }

    #[test]
    fn test_healthy() {
        let mut r = TestResult::new();
        r.erase_time_avg = 40_000.0;
        r.error_rate = 1e-3;
        r.bad_block_count = 12;
        r.read_disturb_errors = EOL_READ_DISTURB_THRESHOLD;
        assert_eq!(check_eol(&mut r, ERROR_RATE_CONSUMER, &info()), None);
        assert!(!r.chip_dead);
        assert_eq!(r.chip_status, ChipStatus::Normal);
    }

    #[test]
    fn test_order() {
        let mut r = TestResult::new();
        r.erase_time_avg = 256.0 * 500.0 + 1.0;
        r.bad_block_count = 100;
        r.error_rate = 0.5;
        r.read_disturb_errors = 100;
        assert!(matches!(eol_reason(&r, 1e-3, &info()), Some(EolReason::EraseTime { .. })));
        r.erase_time_avg = 0.0;
        assert!(matches!(eol_reason(&r, 1e-3, &info()), Some(EolReason::BadBlocks { .. })));
        r.bad_block_count = 0;
        assert!(matches!(eol_reason(&r, 1e-3, &info()), Some(EolReason::ErrorRate { .. })));
        r.error_rate = 0.0;
        assert_eq!(eol_reason(&r, 1e-3, &info()), Some(EolReason::ReadDisturb { count: 100 }));
    }

    #[test]
    fn test_unknown_block_count() {
        let odd = DeviceInfo { block_size: 0, ..info() };
        assert_eq!(erase_time_limit_ms(&odd), EOL_CHIP_ERASE_TIME_MS);
        let mut r = TestResult::new();
        r.bad_block_count = 5;
        assert_eq!(eol_reason(&r, 1e-3, &odd), None);
        r.erase_time_avg = EOL_CHIP_ERASE_TIME_MS + 1.0;
        assert!(matches!(eol_reason(&r, 1e-3, &odd), Some(EolReason::EraseTime { .. })));
    }
}
