//! Performance drift against the baseline, and the periodic deep health check.

use alloc::vec;

use crate::storage::{Clock, FlashDevice};
use crate::*;

/// Percent by which `current` is worse than `baseline`, where larger is worse. Never negative.
pub fn degradation_percent(current: f32, baseline: f32) -> f32 {
    if baseline <= 0.0 || current <= 0.0 {
        return 0.0;
    }
    ((current - baseline) / baseline * 100.0).max(0.0)
}

/// Same as `degradation_percent`, for metrics where smaller is worse.
pub fn shortfall_percent(current: f32, baseline: f32) -> f32 {
    if baseline <= 0.0 {
        return 0.0;
    }
    ((baseline - current) / baseline * 100.0).max(0.0)
}

pub fn classify(worst_degradation: f32) -> ChipStatus {
    if worst_degradation > DEGRADATION_DANGER_RATE {
        ChipStatus::Danger
    } else if worst_degradation > DEGRADATION_WARNING_RATE {
        ChipStatus::Warning
    } else {
        ChipStatus::Normal
    }
}

pub fn worst_degradation(result: &TestResult) -> f32 {
    result.erase_degradation_rate.max(result.program_degradation_rate).max(result.read_speed_degradation_rate)
}

/// Recompute the degradation rates from the running averages, and the soft status from those.
/// A dead chip stays dead.
pub fn update_degradation(result: &mut TestResult) {
    if !result.baseline_recorded {
        result.erase_degradation_rate = 0.0;
        result.program_degradation_rate = 0.0;
        result.read_speed_degradation_rate = 0.0;
        return;
    }
    let b = result.baseline;
    result.erase_degradation_rate = degradation_percent(result.erase_time_avg, b.erase_time_avg);
    result.program_degradation_rate = degradation_percent(result.program_time_avg, b.program_time_avg);
    result.read_speed_degradation_rate = if result.read_speed > 0.0 { shortfall_percent(result.read_speed, b.read_speed) } else { 0.0 };

    if result.chip_status != ChipStatus::Dead {
        let status = classify(worst_degradation(result));
        if status != result.chip_status {
            log::info!(target: "endurance::health", "chip status {:?} -> {:?}", result.chip_status, status);
        }
        result.chip_status = status;
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct HealthReport {
    /// probe pages whose content changed while being re-read
    pub disturbed_pages: u32,
    /// probe page reads that failed outright
    pub read_failures: u32,
    pub read_time_ms: f32,
}

/// Deep health check: refresh the degradation figures and probe for read disturb.
///
/// The probe re-reads the first data sector `READ_DISTURB_PASSES` times and compares
/// each page to its first read. Each page that changes counts once toward
/// `read_disturb_errors`.
pub fn deep_health_check<F: FlashDevice + ?Sized, C: Clock + ?Sized>(
    flash: &mut F,
    clock: &C,
    result: &mut TestResult,
) -> HealthReport {
    update_degradation(result);

    let info = flash.device_info();
    let page = info.page_size as usize;
    let start = info.data_start();
    let pages = (info.sector_size / info.page_size) as usize;
    let mut reference = vec![0u8; page * pages];
    let mut readback = vec![0u8; page];
    let mut valid = vec![false; pages];
    let mut disturbed = vec![false; pages];
    let mut report = HealthReport::default();

    let t = clock.now_us();
    for (i, chunk) in reference.chunks_mut(page).enumerate() {
        match flash.read(start + (i * page) as u32, chunk) {
            Ok(()) => valid[i] = true,
            Err(_) => report.read_failures += 1,
        }
    }
    for _ in 0..READ_DISTURB_PASSES {
        for i in 0..pages {
            if !valid[i] || disturbed[i] {
                continue;
            }
            if flash.read(start + (i * page) as u32, &mut readback).is_err() {
                report.read_failures += 1;
                continue;
            }
            if readback[..] != reference[i * page..(i + 1) * page] {
                disturbed[i] = true;
            }
        }
    }
    report.read_time_ms = clock.elapsed_ms(t);
    report.disturbed_pages = disturbed.iter().filter(|&&d| d).count() as u32;
    result.read_disturb_errors = result.read_disturb_errors.saturating_add(report.disturbed_pages);

    log::info!(
        target: "endurance::health",
        "health check @ cycle {}: erase +{:.1}% program +{:.1}% read -{:.1}% | disturbed pages {} (total {}) | {:?}",
        result.total_cycles,
        result.erase_degradation_rate,
        result.program_degradation_rate,
        result.read_speed_degradation_rate,
        report.disturbed_pages,
        result.read_disturb_errors,
        result.chip_status
    );
    if report.read_failures > 0 {
        log::warn!(target: "endurance::health", "{} probe reads failed", report.read_failures);
    }
    report
}
