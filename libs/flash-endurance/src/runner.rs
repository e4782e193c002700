use alloc::boxed::Box;
use alloc::format;

use crate::checkpoint;
use crate::cycle::{self, CycleReport, CycleState};
use crate::degradation;
use crate::display::{show_lines, Display, NullDisplay};
use crate::eol::{self, EolReason};
use crate::faults::{FaultInjector, NoFaults, SeededFaults};
use crate::storage::{Clock, DeviceInfo, FlashDevice};
use crate::*;

/// Drives a chip from its first cycle (or its last checkpoint) to end of life.
pub struct EnduranceTest<F: FlashDevice, C: Clock> {
    flash: F,
    clock: C,
    config: Config,
    display: Box<dyn Display>,
    faults: Box<dyn FaultInjector>,
    info: DeviceInfo,
    result: TestResult,
    dead_data: Option<DeadData>,
    state: CycleState,
    last_report: Option<CycleReport>,
    eol_reason: Option<EolReason>,
    initialized: bool,
}

impl<F: FlashDevice, C: Clock> EnduranceTest<F, C> {
    pub fn new(flash: F, clock: C, config: Config) -> Self {
        let config = config.validated();
        let faults: Box<dyn FaultInjector> = if config.simulate_fault_enabled {
            log::warn!(target: "endurance", "fault injection is on: this run does not measure the chip");
            Box::new(SeededFaults::new(config.fault_seed, config.simulate_fault_count))
        } else {
            Box::new(NoFaults)
        };
        let info = flash.device_info();
        EnduranceTest {
            flash,
            clock,
            config,
            display: Box::new(NullDisplay),
            faults,
            info,
            result: TestResult::new(),
            dead_data: None,
            state: CycleState::default(),
            last_report: None,
            eol_reason: None,
            initialized: false,
        }
    }

    pub fn with_display(mut self, display: Box<dyn Display>) -> Self {
        self.display = display;
        self
    }

    /// Replace the fault strategy chosen from the config.
    pub fn with_fault_injector(mut self, faults: Box<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Check the device, then resume from the checkpoint or start a fresh run.
    pub fn init(&mut self) -> Result<(), EnduranceError> {
        self.info = self.flash.device_info();
        if !self.info.is_valid() {
            log::error!(target: "endurance", "unusable device geometry: {:?}", self.info);
            return Err(EnduranceError::InvalidArgument);
        }
        log::info!(
            target: "endurance",
            "device: {} KiB, {} blocks of {} KiB, {} byte pages",
            self.info.capacity / 1024,
            self.info.total_blocks(),
            self.info.block_size / 1024,
            self.info.page_size
        );

        match checkpoint::load(&mut self.flash)? {
            Some(cp) => {
                self.result = cp.result;
                self.dead_data = cp.dead_data;
                if self.result.chip_dead || self.dead_data.is_some() {
                    log::info!(target: "endurance", "checkpoint: chip already dead at cycle {}", self.result.total_cycles);
                    self.initialized = true;
                    if self.dead_data.is_none() {
                        self.finish(None)?;
                    }
                    return Ok(());
                }
                log::info!(
                    target: "endurance",
                    "resuming from checkpoint at cycle {} ({:.2}% of rated life)",
                    self.result.total_cycles,
                    self.result.telomere_progress
                );
            }
            None => {
                log::info!(target: "endurance", "no checkpoint, starting a fresh run");
                self.result = TestResult::new();
                self.dead_data = None;
                checkpoint::save(&mut self.flash, &self.result, None)?;
            }
        }
        self.state = CycleState::default();
        self.initialized = true;
        show_lines(self.display.as_mut(), &["Endurance Test", format!("Cycle:{}", self.result.total_cycles).as_str()]);
        Ok(())
    }

    /// Run one cycle and its bookkeeping. Returns `true` once the chip is dead.
    pub fn step(&mut self) -> Result<bool, EnduranceError> {
        if !self.initialized {
            return Err(EnduranceError::NotInitialized);
        }
        if self.result.chip_dead {
            return Ok(true);
        }

        let report = match cycle::run_cycle(
            &mut self.flash,
            &self.clock,
            &self.config,
            self.faults.as_mut(),
            &mut self.result,
            &mut self.state,
        ) {
            Ok(report) => report,
            Err(EnduranceError::ChipDead) => {
                let reason = self.state.hard_failure.take();
                if let Some(r) = reason {
                    log::warn!(target: "endurance::eol", "cycle {}: end of life, {}", self.result.total_cycles, r);
                }
                self.finish(reason)?;
                return Ok(true);
            }
            Err(EnduranceError::StorageFailed) => {
                // keep what was counted; the next step retries
                log::warn!(target: "endurance", "cycle {} hit a storage failure, retrying", self.result.total_cycles + 1);
                checkpoint::save(&mut self.flash, &self.result, None)?;
                return Ok(false);
            }
            Err(EnduranceError::Timeout) => {
                // the erase may have taken the record with it: put it back before giving up the cycle
                log::warn!(target: "endurance", "cycle {} timed out", self.result.total_cycles + 1);
                if let Err(e) = checkpoint::save(&mut self.flash, &self.result, self.dead_data.as_ref()) {
                    log::error!(target: "endurance", "checkpoint not restored after timeout: {:?}", e);
                }
                return Err(EnduranceError::Timeout);
            }
            Err(e) => return Err(e),
        };
        self.last_report = Some(report);

        degradation::update_degradation(&mut self.result);
        let cycle = self.result.current_cycle;
        // a batch can step over a multiple of the interval
        let crossed = |interval: u32| cycle / interval != (cycle - report.erases) / interval;
        if crossed(self.config.deep_check_interval) {
            degradation::deep_health_check(&mut self.flash, &self.clock, &mut self.result);
        }
        if crossed(self.config.log_interval) || self.config.verbose {
            self.report_progress(&report);
        }

        if let Some(reason) = eol::check_eol(&mut self.result, self.config.error_rate_threshold, &self.info) {
            self.finish(Some(reason))?;
            return Ok(true);
        }
        checkpoint::save(&mut self.flash, &self.result, None)?;
        Ok(false)
    }

    /// Cycle until the chip dies, then hand back its final figures.
    ///
    /// A timed-out cycle is retried; `MAX_CONSECUTIVE_TIMEOUTS` of them in a row end the run with `Timeout`.
    pub fn run(&mut self) -> Result<DeadData, EnduranceError> {
        let mut timeouts = 0;
        loop {
            match self.step() {
                Ok(true) => break,
                Ok(false) => timeouts = 0,
                Err(EnduranceError::Timeout) => {
                    timeouts += 1;
                    if timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                        log::error!(target: "endurance", "{} timeouts in a row, stopping", timeouts);
                        return Err(EnduranceError::Timeout);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.dead_data.ok_or(EnduranceError::ChipDead)
    }

    fn report_progress(&mut self, report: &CycleReport) {
        let r = &self.result;
        log::info!(
            target: "endurance",
            "cycle {} | erase {:.1} ms (avg {:.1}, {:.1}..{:.1}) | program {:.3} ms/page | read {:.1} KiB/s | errors {} (rate {:e}) | bad blocks {} | {:?} | life {:.2}% | {} MiB written",
            r.total_cycles,
            report.erase_time_ms,
            r.erase_time_avg,
            r.erase_time_min,
            r.erase_time_max,
            r.program_time_avg,
            r.read_speed,
            r.verify_errors,
            r.error_rate,
            r.bad_block_count,
            r.chip_status,
            r.telomere_progress,
            r.total_mb_written()
        );
        show_lines(
            self.display.as_mut(),
            &[
                format!("Cycle:{}", r.total_cycles).as_str(),
                format!("Erase:{:.0}ms", report.erase_time_ms).as_str(),
                format!("Err:{:.1e}", r.error_rate).as_str(),
                format!("{:?} {:.1}%", r.chip_status, r.telomere_progress).as_str(),
            ],
        );
    }

    /// Record end of life: capture the final figures once, persist them, and report.
    fn finish(&mut self, reason: Option<EolReason>) -> Result<(), EnduranceError> {
        self.result.declare_dead();
        if reason.is_some() {
            self.eol_reason = reason;
        }
        let captured = DeadData::capture(&self.result);
        let cp = checkpoint::save(&mut self.flash, &self.result, Some(&captured))?;
        self.dead_data = cp.dead_data;
        self.log_summary();
        let gb = self.result.total_bytes_written as f64 / (1024.0 * 1024.0 * 1024.0);
        show_lines(self.display.as_mut(), &["Chip Dead", format!("Total:{:.2}GB", gb).as_str()]);
        Ok(())
    }

    fn log_summary(&self) {
        let r = &self.result;
        log::info!(target: "endurance", "=== endurance test complete ===");
        if let Some(reason) = self.eol_reason {
            log::info!(target: "endurance", "  cause: {}", reason);
        }
        if let Some(d) = self.dead_data {
            log::info!(target: "endurance", "  died at cycle {} ({:.2}% of {} rated)", d.dead_cycle, d.telomere_progress_final, RATED_PE_CYCLES);
            log::info!(target: "endurance", "  final erase {:.1} ms, program {:.3} ms/page, read {:.1} KiB/s", d.erase_time_final, d.program_time_final, d.read_speed_final);
            log::info!(
                target: "endurance",
                "  erase failures {}, program failures {}, bit errors {}, bad blocks {}, error rate {:e}",
                d.erase_errors_final,
                d.program_errors_final,
                d.verify_errors_final,
                d.bad_block_count_final,
                d.error_rate_final
            );
        }
        log::info!(
            target: "endurance",
            "  baseline erase {:.1} ms, program {:.3} ms/page, read {:.1} KiB/s",
            r.baseline.erase_time_avg,
            r.baseline.program_time_avg,
            r.baseline.read_speed
        );
        log::info!(
            target: "endurance",
            "  degradation: erase {:.1}%, program {:.1}%, read {:.1}%",
            r.erase_degradation_rate,
            r.program_degradation_rate,
            r.read_speed_degradation_rate
        );
        log::info!(target: "endurance", "  {} MiB written over {} verify passes", r.total_mb_written(), r.verify_passes);
    }

    pub fn result(&self) -> &TestResult { &self.result }

    pub fn dead_data(&self) -> Option<&DeadData> { self.dead_data.as_ref() }

    pub fn config(&self) -> &Config { &self.config }

    pub fn last_report(&self) -> Option<&CycleReport> { self.last_report.as_ref() }

    /// What ended the run, if this process saw it happen.
    pub fn eol_reason(&self) -> Option<EolReason> { self.eol_reason }

    pub fn flash(&self) -> &F { &self.flash }

    pub fn flash_mut(&mut self) -> &mut F { &mut self.flash }

    pub fn into_flash(self) -> F { self.flash }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{EmuFlash, SimClock};

    #[test]
    fn test_not_initialized() {
        let clock = SimClock::new();
        let flash = EmuFlash::new(EmuFlash::small_geometry(), clock.clone());
        let mut test = EnduranceTest::new(flash, clock, Config::default());
        assert_eq!(test.step(), Err(EnduranceError::NotInitialized));
        assert_eq!(test.run(), Err(EnduranceError::NotInitialized));
        // nothing touched the chip
        assert_eq!(test.flash().chip_erases(), 0);
        assert_eq!(test.flash().page_writes(), 0);
    }

    #[test]
    fn test_invalid_geometry() {
        let clock = SimClock::new();
        let info = DeviceInfo { capacity: 65536, ..EmuFlash::small_geometry() };
        let mut test = EnduranceTest::new(EmuFlash::new(info, clock.clone()), clock, Config::default());
        assert_eq!(test.init(), Err(EnduranceError::InvalidArgument));
        assert_eq!(test.step(), Err(EnduranceError::NotInitialized));
    }

    #[test]
    fn test_fresh_start_saves_checkpoint() {
        let clock = SimClock::new();
        let flash = EmuFlash::new(EmuFlash::small_geometry(), clock.clone());
        let mut test = EnduranceTest::new(flash, clock, Config::default());
        test.init().unwrap();
        let cp = checkpoint::load(test.flash_mut()).unwrap().unwrap();
        assert_eq!(cp.result, TestResult::new());
        assert_eq!(cp.test_status, TestStatus::Running);
        assert!(!test.step().unwrap());
        assert_eq!(test.result().total_cycles, 1);
    }
}
