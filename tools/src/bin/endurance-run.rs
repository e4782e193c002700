#[macro_use]
extern crate clap;

use std::path::Path;

use clap::{App, Arg};
use flash_endurance::hosted::SimClock;
use flash_endurance::{
    checkpoint, Clock, Config, Display, EnduranceError, EnduranceTest, LogDisplay, NullDisplay, MAX_CONSECUTIVE_TIMEOUTS,
};
use flash_endurance_tools::image;
use flash_endurance_tools::utils::{parse_error_rate, parse_geometry, parse_u32, parse_u64};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let matches = App::new("Flash Endurance Runner")
        .version(crate_version!())
        .about("Cycle an emulated flash image toward end of life. Progress is kept in the image, so runs can be interrupted and resumed.")
        .arg(Arg::with_name("image").required(true).help("Flash image file; created blank if it doesn't exist"))
        .arg(Arg::with_name("capacity").long("capacity").takes_value(true).default_value("1M").help("Chip capacity in bytes"))
        .arg(Arg::with_name("page").long("page").takes_value(true).default_value("256").help("Page size in bytes"))
        .arg(Arg::with_name("sector").long("sector").takes_value(true).default_value("4k").help("Sector size in bytes"))
        .arg(Arg::with_name("block").long("block").takes_value(true).default_value("64k").help("Block size in bytes"))
        .arg(
            Arg::with_name("wear")
                .long("wear")
                .takes_value(true)
                .help("Emulate a part that starts wearing out after this many erase cycles"),
        )
        .arg(
            Arg::with_name("deep-check-interval")
                .long("deep-check-interval")
                .takes_value(true)
                .default_value("1000")
                .help("Cycles between deep health checks"),
        )
        .arg(Arg::with_name("log-interval").long("log-interval").takes_value(true).default_value("100").help("Cycles between progress reports"))
        .arg(Arg::with_name("verbose").short("v").long("verbose").help("Report every cycle, with per-phase progress"))
        .arg(
            Arg::with_name("consecutive-erase")
                .long("consecutive-erase")
                .takes_value(true)
                .default_value("1")
                .help("Chip erases per write+verify pass (1-100)"),
        )
        .arg(
            Arg::with_name("error-rate")
                .long("error-rate")
                .takes_value(true)
                .default_value("consumer")
                .help("End-of-life bit error rate: a fraction, or one of consumer, industrial, automotive, high-reliability"),
        )
        .arg(
            Arg::with_name("simulate-faults")
                .long("simulate-faults")
                .takes_value(true)
                .help("Diagnostic: corrupt this many bytes (1-10) per cycle to exercise the verify path"),
        )
        .arg(Arg::with_name("fault-seed").long("fault-seed").takes_value(true).help("Seed for --simulate-faults"))
        .arg(
            Arg::with_name("stop-after")
                .long("stop-after")
                .takes_value(true)
                .help("Stop after this many cycles, as if power were cut"),
        )
        .arg(Arg::with_name("display").long("display").help("Mirror the status panel to the log"))
        .arg(Arg::with_name("reset").long("reset").help("Discard any checkpoint and start over"))
        .get_matches();

    let path = Path::new(matches.value_of("image").unwrap_or_default());
    let info = parse_geometry(
        matches.value_of("capacity").unwrap_or("1M"),
        matches.value_of("page").unwrap_or("256"),
        matches.value_of("sector").unwrap_or("4k"),
        matches.value_of("block").unwrap_or("64k"),
    )?;
    let wear = matches.value_of("wear").map(parse_u32).transpose()?;

    let mut config = Config {
        deep_check_interval: parse_u32(matches.value_of("deep-check-interval").unwrap_or("1000"))?,
        log_interval: parse_u32(matches.value_of("log-interval").unwrap_or("100"))?,
        verbose: matches.is_present("verbose"),
        consecutive_erase_count: parse_u32(matches.value_of("consecutive-erase").unwrap_or("1"))?,
        error_rate_threshold: parse_error_rate(matches.value_of("error-rate").unwrap_or("consumer"))?,
        ..Default::default()
    };
    if let Some(count) = matches.value_of("simulate-faults") {
        config.simulate_fault_enabled = true;
        config.simulate_fault_count = parse_u32(count)?;
    }
    if let Some(seed) = matches.value_of("fault-seed") {
        config.fault_seed = parse_u64(seed)?;
    }
    let stop_after = matches.value_of("stop-after").map(parse_u32).transpose()?;

    let clock = SimClock::new();
    let mut flash = image::open(path, info, clock.clone(), wear)?;
    if matches.is_present("reset") {
        log::info!("discarding checkpoint in {}", path.display());
        checkpoint::clear(&mut flash)?;
    }
    let display: Box<dyn Display> = if matches.is_present("display") { Box::new(LogDisplay) } else { Box::new(NullDisplay) };
    let mut test = EnduranceTest::new(flash, clock.clone(), config).with_display(display);
    test.init()?;

    let mut cycles = 0;
    let mut timeouts = 0;
    let outcome = loop {
        if stop_after.map_or(false, |n| cycles >= n) {
            break Ok(false);
        }
        match test.step() {
            Ok(true) => break Ok(true),
            Ok(false) => {
                cycles += 1;
                timeouts = 0;
            }
            Err(EnduranceError::Timeout) if timeouts + 1 < MAX_CONSECUTIVE_TIMEOUTS => {
                timeouts += 1;
                log::warn!("cycle timed out, retrying");
            }
            Err(e) => break Err(e),
        }
    };
    // whatever happened, the chip keeps its contents
    image::store(path, test.flash())?;

    let r = test.result();
    println!("image:          {}", path.display());
    println!("cycles:         {} ({} this run)", r.total_cycles, cycles);
    println!("life consumed:  {:.2}%", r.telomere_progress);
    println!("status:         {:?}", r.chip_status);
    println!("error rate:     {:e}", r.error_rate);
    println!("data written:   {} MiB", r.total_mb_written());
    println!("emulated time:  {:.1} s", clock.now_us() as f64 / 1_000_000.0);
    if let Some(reason) = test.eol_reason() {
        println!("end of life:    {}", reason);
    }
    match outcome {
        Ok(true) => println!("chip is dead; see read-checkpoint for the final figures"),
        Ok(false) => println!("stopped; run again to resume"),
        Err(e) => {
            log::error!("run aborted: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
