//! One erase -> program -> verify pass over the chip.

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use crate::checkpoint;
use crate::eol::EolReason;
use crate::faults::FaultInjector;
use crate::pattern::{self, PageErrors};
use crate::storage::{Clock, DeviceInfo, FlashDevice, FlashError};
use crate::*;

/// Executor state that lives across cycles but is not persisted.
#[derive(Debug, Default)]
pub struct CycleState {
    /// erase failures since the last good erase
    pub erase_fail_consecutive: u32,
    /// set when the executor itself declares the chip dead
    pub hard_failure: Option<EolReason>,
}

/// What one cycle measured.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// physical chip erases in this cycle's batch
    pub erases: u32,
    /// mean time of one erase in the batch, ms
    pub erase_time_ms: f32,
    pub pages_programmed: u32,
    pub program_failures: u32,
    /// mean program time per page, ms
    pub program_time_ms: f32,
    pub pages_read: u32,
    pub read_failures: u32,
    /// KiB/s
    pub read_speed: f32,
    /// all bit errors of the verify pass, injected ones included
    pub bit_errors: u64,
    pub injected_errors: u64,
    pub bits_read: u64,
    /// blocks that failed a program or showed too many bit errors
    pub bad_blocks: u32,
}

impl CycleReport {
    pub fn error_rate(&self) -> f32 {
        if self.bits_read == 0 { 0.0 } else { (self.bit_errors as f64 / self.bits_read as f64).min(1.0) as f32 }
    }
}

/// Steps through a long page loop, emitting a progress line every 10%.
struct Progress {
    step: u32,
    count: u32,
    total: u32,
    level: log::Level,
}
impl Progress {
    fn new(total: u32, verbose: bool) -> Self {
        Progress {
            step: (total / 10).max(1),
            count: 0,
            total,
            level: if verbose { log::Level::Info } else { log::Level::Trace },
        }
    }

    fn tick(&mut self, cycle: u32, phase: &str) {
        self.count += 1;
        if self.count % self.step == 0 {
            log::log!(
                target: "endurance::cycle",
                self.level,
                "[cycle {}] {} {}/{} pages ({}%)",
                cycle,
                phase,
                self.count,
                self.total,
                self.count as u64 * 100 / self.total.max(1) as u64
            );
        }
    }
}

/// Run one cycle.
///
/// The chip is erased `consecutive_erase_count` times (once on the first cycle of a run).
/// After each erase the counters advance and the checkpoint is put back before anything
/// else touches the chip. Then every page outside the reserved block is programmed with
/// the cycle's fill byte and read back.
///
/// Errors: `ChipDead` when the executor hits a hard failure threshold (the reason is left in
/// `state.hard_failure`); `StorageFailed` for an erase failure below the threshold or a failed
/// checkpoint access; `Timeout` when an erase or checkpoint restore didn't finish in time.
pub fn run_cycle<F: FlashDevice + ?Sized, C: Clock + ?Sized>(
    flash: &mut F,
    clock: &C,
    config: &Config,
    faults: &mut dyn FaultInjector,
    result: &mut TestResult,
    state: &mut CycleState,
) -> Result<CycleReport, EnduranceError> {
    if result.chip_dead {
        return Err(EnduranceError::ChipDead);
    }
    let info = flash.device_info();
    let mut report = CycleReport::default();

    erase_batch(flash, clock, config, result, state, &info, &mut report)?;
    let cycle = result.current_cycle;

    let injected = if faults.is_active() {
        let addrs = faults.fault_addresses(cycle, info.data_start(), info.sector_size);
        log::debug!(target: "endurance::faults", "[cycle {}] injecting {} faults: {:x?}", cycle, addrs.len(), addrs);
        addrs
    } else {
        Vec::new()
    };

    let mut bad_blocks = BTreeSet::new();
    program_pass(flash, clock, config, result, state, &info, &injected, &mut bad_blocks, &mut report)?;
    verify_pass(flash, clock, config, result, &info, &injected, &mut bad_blocks, &mut report);
    report.bad_blocks = bad_blocks.len() as u32;

    // fold the samples into the running figures
    result.verify_passes += 1;
    let n = result.verify_passes as f32;
    if report.pages_programmed > 0 {
        result.program_time_avg = (result.program_time_avg * (n - 1.0) + report.program_time_ms) / n;
    }
    if report.read_speed > 0.0 {
        result.read_speed = (result.read_speed * (n - 1.0) + report.read_speed) / n;
    }
    result.verify_errors += report.bit_errors;
    result.error_rate = report.error_rate();
    result.bad_block_count = result.bad_block_count.max(report.bad_blocks);

    if !result.baseline_recorded && result.baseline.is_unset() {
        result.baseline = Baseline {
            erase_time_avg: report.erase_time_ms,
            program_time_avg: report.program_time_ms,
            read_speed: report.read_speed,
            error_rate: result.error_rate,
            unique_id: 0,
        };
        result.baseline_recorded = true;
        log::info!(
            target: "endurance",
            "baseline recorded: erase {:.2} ms ({:.2} ms/block), program {:.3} ms/page, read {:.1} KiB/s, error rate {:e}",
            report.erase_time_ms,
            report.erase_time_ms / info.total_blocks().max(1) as f32,
            report.program_time_ms,
            report.read_speed,
            result.error_rate
        );
    }

    log::debug!(
        target: "endurance::cycle",
        "[cycle {}] done: {} erases, {} bit errors ({} injected), {} bad blocks",
        cycle,
        report.erases,
        report.bit_errors,
        report.injected_errors,
        report.bad_blocks
    );
    Ok(report)
}

fn erase_batch<F: FlashDevice + ?Sized, C: Clock + ?Sized>(
    flash: &mut F,
    clock: &C,
    config: &Config,
    result: &mut TestResult,
    state: &mut CycleState,
    info: &DeviceInfo,
    report: &mut CycleReport,
) -> Result<(), EnduranceError> {
    let batch = if result.total_cycles == 0 { 1 } else { config.consecutive_erase_count.max(1) };
    // the chip erase takes the checkpoint with it; hold on to what must survive
    let dead_data = checkpoint::load(flash)?.and_then(|cp| cp.dead_data);
    let timeout = info.chip_erase_timeout_ms();

    log::debug!(
        target: "endurance::cycle",
        "[cycle {}] erasing {} blocks x{} (expect ~{:.1} s each)",
        result.current_cycle + 1,
        info.total_blocks(),
        batch,
        info.expected_chip_erase_ms() / 1000.0
    );
    let mut total_ms = 0.0;
    for _ in 0..batch {
        let start = clock.now_us();
        let status = flash.erase_chip().and_then(|_| flash.wait_ready(timeout));
        let err = match status {
            Ok(()) => None,
            Err(FlashError::Timeout) => {
                result.erase_errors += 1;
                log::error!(target: "endurance::cycle", "[cycle {}] erase timed out after {} ms", result.current_cycle + 1, timeout);
                Some(EnduranceError::Timeout)
            }
            Err(FlashError::Failed) => {
                result.erase_errors += 1;
                state.erase_fail_consecutive += 1;
                if state.erase_fail_consecutive >= EOL_ERASE_FAIL_COUNT {
                    state.hard_failure = Some(EolReason::EraseFailures(state.erase_fail_consecutive));
                    result.declare_dead();
                    Some(EnduranceError::ChipDead)
                } else {
                    log::warn!(
                        target: "endurance::cycle",
                        "[cycle {}] erase failed ({} in a row)",
                        result.current_cycle + 1,
                        state.erase_fail_consecutive
                    );
                    Some(EnduranceError::StorageFailed)
                }
            }
        };
        if let Some(e) = err {
            // the erases that did land this batch are already counted
            fold_erase_time(result, report, total_ms);
            return Err(e);
        }
        let elapsed = clock.elapsed_ms(start);
        total_ms += elapsed;
        state.erase_fail_consecutive = 0;
        report.erases += 1;

        result.total_cycles += 1;
        result.current_cycle += 1;
        result.telomere_progress = result.total_cycles as f32 * 100.0 / RATED_PE_CYCLES as f32;
        log::trace!(target: "endurance::cycle", "[cycle {}] erase took {:.2} ms", result.current_cycle, elapsed);

        if let Err(e) = checkpoint::save(flash, result, dead_data.as_ref()) {
            fold_erase_time(result, report, total_ms);
            return Err(e);
        }
    }
    fold_erase_time(result, report, total_ms);
    Ok(())
}

/// Fold the `report.erases` erases that took `total_ms` between them into the running figures.
fn fold_erase_time(result: &mut TestResult, report: &mut CycleReport, total_ms: f32) {
    if report.erases == 0 {
        return;
    }
    let b = report.erases as f32;
    let sample = total_ms / b;
    report.erase_time_ms = sample;
    result.erase_time_current = sample;
    if result.erase_time_min == 0.0 || sample < result.erase_time_min {
        result.erase_time_min = sample;
    }
    if sample > result.erase_time_max {
        result.erase_time_max = sample;
    }
    // weighted so every physical erase counts once
    let n = result.total_cycles as f32;
    result.erase_time_avg = if n <= b { sample } else { (result.erase_time_avg * (n - b) + sample * b) / n };
}

#[allow(clippy::too_many_arguments)]
fn program_pass<F: FlashDevice + ?Sized, C: Clock + ?Sized>(
    flash: &mut F,
    clock: &C,
    config: &Config,
    result: &mut TestResult,
    state: &mut CycleState,
    info: &DeviceInfo,
    injected: &[u32],
    bad_blocks: &mut BTreeSet<u32>,
    report: &mut CycleReport,
) -> Result<(), EnduranceError> {
    let cycle = result.current_cycle;
    let page = info.page_size;
    let mut buf = vec![0u8; page as usize];
    let pages = (info.capacity - info.data_start()) / page;
    let mut progress = Progress::new(pages, config.verbose);
    let mut time_sum = 0.0;

    log::debug!(target: "endurance::cycle", "[cycle {}] programming {} pages with 0x{:02x}", cycle, pages, pattern::fill_byte(cycle));
    for addr in (info.data_start()..info.capacity).step_by(page as usize) {
        pattern::generate(&mut buf, cycle);
        for &a in injected.iter().filter(|&&a| a >= addr && a < addr + page) {
            buf[(a - addr) as usize] = FAULT_SENTINEL;
        }

        let start = clock.now_us();
        let status = flash.write(addr, &buf).and_then(|_| flash.wait_ready(PROGRAM_TIMEOUT_MS));
        match status {
            Ok(()) => {
                time_sum += clock.elapsed_ms(start);
                report.pages_programmed += 1;
                result.total_bytes_written += page as u64;
            }
            Err(e) => {
                report.program_failures += 1;
                result.program_errors += 1;
                bad_blocks.insert(addr / info.block_size);
                log::warn!(target: "endurance::cycle", "[cycle {}] program {:?} at {:08x}", cycle, e, addr);
                if report.program_failures >= EOL_PROGRAM_FAIL_COUNT {
                    state.hard_failure = Some(EolReason::ProgramFailures(report.program_failures));
                    result.declare_dead();
                    return Err(EnduranceError::ChipDead);
                }
            }
        }
        progress.tick(cycle, "program");
    }
    if report.pages_programmed > 0 {
        report.program_time_ms = time_sum / report.pages_programmed as f32;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn verify_pass<F: FlashDevice + ?Sized, C: Clock + ?Sized>(
    flash: &mut F,
    clock: &C,
    config: &Config,
    result: &TestResult,
    info: &DeviceInfo,
    injected: &[u32],
    bad_blocks: &mut BTreeSet<u32>,
    report: &mut CycleReport,
) {
    let cycle = result.current_cycle;
    let page = info.page_size;
    let mut expected = vec![0u8; page as usize];
    let mut actual = vec![0u8; page as usize];
    let pages = (info.capacity - info.data_start()) / page;
    let mut progress = Progress::new(pages, config.verbose);
    let mut offsets = Vec::new();
    let mut time_sum = 0.0;

    pattern::generate(&mut expected, cycle);
    for addr in (info.data_start()..info.capacity).step_by(page as usize) {
        let start = clock.now_us();
        if let Err(e) = flash.read(addr, &mut actual) {
            report.read_failures += 1;
            log::warn!(target: "endurance::cycle", "[cycle {}] read {:?} at {:08x}, page skipped", cycle, e, addr);
            progress.tick(cycle, "verify");
            continue;
        }
        time_sum += clock.elapsed_ms(start);
        report.pages_read += 1;
        report.bits_read += page as u64 * 8;

        offsets.clear();
        offsets.extend(injected.iter().filter(|&&a| a >= addr && a < addr + page).map(|&a| (a - addr) as usize));
        let errors = if offsets.is_empty() {
            PageErrors { injected: 0, normal: pattern::count_bit_errors(&expected, &actual) }
        } else {
            pattern::count_split_errors(&expected, &actual, &offsets)
        };
        if errors.injected > 0 {
            log::debug!(target: "endurance::faults", "[cycle {}] {:08x}: {} injected bit errors", cycle, addr, errors.injected);
        }
        if errors.normal > 0 {
            log::debug!(target: "endurance::cycle", "[cycle {}] {:08x}: {} bit errors", cycle, addr, errors.normal);
        }
        if errors.normal > BAD_PAGE_BIT_ERRORS {
            bad_blocks.insert(addr / info.block_size);
        }
        report.bit_errors += errors.total() as u64;
        report.injected_errors += errors.injected as u64;
        progress.tick(cycle, "verify");
    }
    if report.pages_read > 0 && time_sum > 0.0 {
        let per_page_ms = time_sum / report.pages_read as f32;
        report.read_speed = (page as f32 / 1024.0) / (per_page_ms / 1000.0);
    }
    log::debug!(
        target: "endurance::cycle",
        "[cycle {}] verified {} pages, {} bit errors, {} unreadable",
        cycle,
        report.pages_read,
        report.bit_errors,
        report.read_failures
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::NoFaults;
    use crate::hosted::{EmuFlash, SimClock, Timing};

    struct FixedFaults(Vec<u32>);
    impl FaultInjector for FixedFaults {
        fn fault_addresses(&mut self, _cycle: u32, _start: u32, _size: u32) -> Vec<u32> { self.0.clone() }

        fn is_active(&self) -> bool { true }
    }

    fn setup() -> (EmuFlash, SimClock) {
        let clock = SimClock::new();
        (EmuFlash::new(EmuFlash::small_geometry(), clock.clone()), clock)
    }

    #[test]
    fn test_first_cycle() {
        let (mut flash, clock) = setup();
        let info = flash.device_info();
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        let config = Config { consecutive_erase_count: 10, ..Default::default() };
        let report = run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state).unwrap();

        // never batched on a fresh run
        assert_eq!(report.erases, 1);
        assert_eq!(flash.chip_erases(), 1);
        assert_eq!(result.total_cycles, 1);
        assert_eq!(result.current_cycle, 1);
        let data_pages = (info.capacity - info.data_start()) / info.page_size;
        assert_eq!(report.pages_programmed, data_pages);
        assert_eq!(report.pages_read, data_pages);
        assert_eq!(report.bit_errors, 0);
        assert_eq!(result.error_rate, 0.0);
        assert_eq!(result.total_bytes_written, (info.capacity - info.data_start()) as u64);
        // 4 blocks at 150 ms
        assert!((report.erase_time_ms - 600.0).abs() < 0.01);
        assert!((result.read_speed - 2500.0).abs() < 1.0);
        assert!(result.baseline_recorded);
        assert_eq!(result.baseline.erase_time_avg, report.erase_time_ms);
        assert_eq!(result.baseline.program_time_avg, report.program_time_ms);

        // the data area holds the pattern and the checkpoint survived the erase
        assert!(flash.read_range(info.data_start(), 4096).iter().all(|&b| b == 0x01));
        let cp = checkpoint::load(&mut flash).unwrap().unwrap();
        assert_eq!(cp.result.total_cycles, 1);
    }

    #[test]
    fn test_injected_faults_in_one_page() {
        let (mut flash, clock) = setup();
        let info = flash.device_info();
        let page = info.data_start() + 0x300;
        let offsets = [3u32, 17, 64, 65, 200];
        let mut faults = FixedFaults(offsets.iter().map(|o| page + o).collect());
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        let report = run_cycle(&mut flash, &clock, &Config::default(), &mut faults, &mut result, &mut state).unwrap();

        // fill 0x01 against the 0xff sentinel: 7 bits per offset, nothing anywhere else
        assert_eq!(report.injected_errors, 7 * offsets.len() as u64);
        assert_eq!(report.bit_errors, report.injected_errors);
        let data = flash.read_range(page, 256);
        for (i, &b) in data.iter().enumerate() {
            if offsets.contains(&(i as u32)) {
                assert_eq!(b, FAULT_SENTINEL);
            } else {
                assert_eq!(b, 0x01, "offset {}", i);
            }
        }
        // injected errors don't make a block bad
        assert_eq!(report.bad_blocks, 0);
        assert_eq!(result.verify_errors, report.bit_errors);
    }

    #[test]
    fn test_program_failures() {
        let (mut flash, clock) = setup();
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        flash.fail_next_data_programs(2);
        let report = run_cycle(&mut flash, &clock, &Config::default(), &mut NoFaults, &mut result, &mut state).unwrap();
        assert_eq!(report.program_failures, 2);
        assert_eq!(result.program_errors, 2);
        assert_eq!(result.bad_block_count, 1);
        // the skipped pages read back erased
        assert!(report.bit_errors > 0);

        flash.fail_next_data_programs(EOL_PROGRAM_FAIL_COUNT);
        let err = run_cycle(&mut flash, &clock, &Config::default(), &mut NoFaults, &mut result, &mut state);
        assert_eq!(err, Err(EnduranceError::ChipDead));
        assert_eq!(state.hard_failure, Some(EolReason::ProgramFailures(EOL_PROGRAM_FAIL_COUNT)));
        assert!(result.chip_dead);
    }

    #[test]
    fn test_read_failures_shrink_denominator() {
        let (mut flash, clock) = setup();
        let info = flash.device_info();
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        flash.fail_next_data_reads(2);
        let report = run_cycle(&mut flash, &clock, &Config::default(), &mut NoFaults, &mut result, &mut state).unwrap();
        let data_pages = (info.capacity - info.data_start()) / info.page_size;
        assert_eq!(report.read_failures, 2);
        assert_eq!(report.pages_read, data_pages - 2);
        assert_eq!(report.bits_read, (data_pages - 2) as u64 * 256 * 8);
        assert_eq!(result.error_rate, 0.0);
    }

    #[test]
    fn test_erase_failures() {
        let (mut flash, clock) = setup();
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        let config = Config::default();
        flash.fail_next_chip_erases(2);
        for n in 1..=2 {
            assert_eq!(run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state), Err(EnduranceError::StorageFailed));
            assert_eq!(state.erase_fail_consecutive, n);
        }
        assert_eq!(result.total_cycles, 0);
        // a good erase resets the streak
        run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state).unwrap();
        assert_eq!(state.erase_fail_consecutive, 0);
        assert_eq!(result.erase_errors, 2);

        flash.fail_next_chip_erases(3);
        let _ = run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state);
        let _ = run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state);
        assert_eq!(run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state), Err(EnduranceError::ChipDead));
        assert_eq!(state.hard_failure, Some(EolReason::EraseFailures(3)));
        assert_eq!(result.chip_status, ChipStatus::Dead);
    }

    #[test]
    fn test_erase_timeout() {
        let (mut flash, clock) = setup();
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        flash.timeout_next_waits(1);
        let err = run_cycle(&mut flash, &clock, &Config::default(), &mut NoFaults, &mut result, &mut state);
        assert_eq!(err, Err(EnduranceError::Timeout));
        assert_eq!(result.erase_errors, 1);
        assert_eq!(result.total_cycles, 0);
        assert!(!result.chip_dead);
    }

    #[test]
    fn test_partial_batch_counts_its_erases() {
        let clock = SimClock::new();
        let timing = Timing { erase_growth_per_erase: 0.1, ..Default::default() };
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), clock.clone()).with_timing(timing);
        let mut result = TestResult::new();
        let mut state = CycleState::default();
        run_cycle(&mut flash, &clock, &Config::default(), &mut NoFaults, &mut result, &mut state).unwrap();
        assert!((result.erase_time_avg - 600.0).abs() < 0.5);

        // each erase waits once and its checkpoint restore twice: the third erase times out
        let config = Config { consecutive_erase_count: 5, ..Default::default() };
        flash.timeout_waits_after(6, 1);
        let err = run_cycle(&mut flash, &clock, &config, &mut NoFaults, &mut result, &mut state);
        assert_eq!(err, Err(EnduranceError::Timeout));
        assert_eq!(result.total_cycles, 3);
        // the two that landed took 660 and 720 ms
        assert!((result.erase_time_current - 690.0).abs() < 0.5, "{}", result.erase_time_current);
        assert!((result.erase_time_max - 690.0).abs() < 0.5);
        assert!((result.erase_time_avg - 660.0).abs() < 0.5, "{}", result.erase_time_avg);
        assert_eq!(result.verify_passes, 1);
    }
}
