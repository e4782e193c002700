use std::env;
use std::fs;
use std::process;

use flash_endurance::checkpoint::{self, RecordError, RECORD_LEN};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: {} [flash.img]", args.get(0).map(|a| a.as_str()).unwrap_or("read-checkpoint"));
        process::exit(1);
    }

    let data = fs::read(&args[1])?;
    if data.len() < RECORD_LEN {
        eprintln!("{} is too short to hold a checkpoint ({} bytes)", args[1], data.len());
        process::exit(1);
    }
    let cp = match checkpoint::decode(&data) {
        Ok(cp) => cp,
        Err(RecordError::BadMagic(m)) => {
            println!("No checkpoint (magic {:08x})", m);
            return Ok(());
        }
        Err(RecordError::BadCrc { stored, computed }) => {
            println!("Checkpoint CRC: FAIL (stored {:08x}, calc: {:08x})", stored, computed);
            process::exit(2);
        }
        Err(e) => {
            println!("Unusable checkpoint: {:?}", e);
            process::exit(2);
        }
    };
    println!("Checkpoint CRC: OK ({:08x})", checkpoint::record_crc(&data));
    println!("Status: {:?}", cp.test_status);

    let r = &cp.result;
    println!("Cycles: {} (current {}), {} verify passes", r.total_cycles, r.current_cycle, r.verify_passes);
    println!("Life consumed: {:.3}%", r.telomere_progress);
    println!("Data written: {} MiB", r.total_mb_written());
    println!(
        "Erase: {:.2} ms avg, {:.2} ms last, {:.2}..{:.2} ms",
        r.erase_time_avg, r.erase_time_current, r.erase_time_min, r.erase_time_max
    );
    println!("Program: {:.3} ms/page", r.program_time_avg);
    println!("Read: {:.1} KiB/s", r.read_speed);
    println!(
        "Errors: {} erase, {} program, {} bit, {} read disturb; {} bad blocks",
        r.erase_errors, r.program_errors, r.verify_errors, r.read_disturb_errors, r.bad_block_count
    );
    println!("Error rate: {:e}", r.error_rate);
    println!(
        "Degradation: erase {:.1}%, program {:.1}%, read {:.1}%",
        r.erase_degradation_rate, r.program_degradation_rate, r.read_speed_degradation_rate
    );
    println!("Chip status: {:?}", r.chip_status);
    if r.baseline_recorded {
        let b = &r.baseline;
        println!(
            "Baseline: erase {:.2} ms, program {:.3} ms/page, read {:.1} KiB/s, error rate {:e}",
            b.erase_time_avg, b.program_time_avg, b.read_speed, b.error_rate
        );
    } else {
        println!("Baseline: not recorded");
    }
    match cp.dead_data {
        Some(d) => {
            println!("Dead at cycle {} ({:.3}% of rated life)", d.dead_cycle, d.telomere_progress_final);
            println!(
                "  final: erase {:.2} ms, program {:.3} ms/page, read {:.1} KiB/s, error rate {:e}",
                d.erase_time_final, d.program_time_final, d.read_speed_final, d.error_rate_final
            );
            println!(
                "  final errors: {} erase, {} program, {} bit; {} bad blocks",
                d.erase_errors_final, d.program_errors_final, d.verify_errors_final, d.bad_block_count_final
            );
            println!("  data written: {} bytes", d.total_bytes_written_final);
        }
        None => println!("Dead data: not recorded"),
    }
    Ok(())
}
