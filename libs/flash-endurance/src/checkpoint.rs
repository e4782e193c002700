//! The checkpoint record: test state persisted in the reserved first sector of the chip.
//!
//! Layout, little-endian, `RECORD_LEN` bytes:
//!
//! ```text
//!   0  magic u32 | version u16 | test_status u8 | reserved u8
//!   8  Baseline block   (24 bytes)
//!  32  TestResult block (92 bytes)
//! 124  DeadData block   (56 bytes)
//! 180  dead_data_recorded u8 | 3 bytes padding
//! 184  crc32 (IEEE) over bytes 0..184
//! ```
//!
//! The header is programmed after the body, so a record only becomes valid once
//! everything else is in place. The CRC catches a record whose header survived but
//! whose body did not.

use crc::{crc32, Hasher32};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::storage::{FlashDevice, FlashError};
use crate::*;

pub const HEADER_LEN: usize = 8;
const BASELINE_LEN: usize = 24;
const RESULT_LEN: usize = 92;
const DEAD_LEN: usize = 56;
const CRC_OFFSET: usize = HEADER_LEN + BASELINE_LEN + RESULT_LEN + DEAD_LEN + 4;
pub const RECORD_LEN: usize = CRC_OFFSET + 4;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Checkpoint {
    pub test_status: TestStatus,
    pub result: TestResult,
    /// `Some` once end of life has been recorded; preserved verbatim from then on
    pub dead_data: Option<DeadData>,
}

impl Checkpoint {
    pub fn new(result: &TestResult, dead_data: Option<&DeadData>) -> Checkpoint {
        Checkpoint {
            test_status: if result.chip_dead { TestStatus::Completed } else { TestStatus::Running },
            result: *result,
            dead_data: dead_data.copied(),
        }
    }
}

struct RecordWriter {
    buf: [u8; RECORD_LEN],
    pos: usize,
}
impl RecordWriter {
    fn new() -> Self { RecordWriter { buf: [0; RECORD_LEN], pos: 0 } }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) { self.put(&[v]); }

    fn u16(&mut self, v: u16) { self.put(&v.to_le_bytes()); }

    fn u32(&mut self, v: u32) { self.put(&v.to_le_bytes()); }

    fn u64(&mut self, v: u64) { self.put(&v.to_le_bytes()); }

    fn f32(&mut self, v: f32) { self.put(&v.to_bits().to_le_bytes()); }

    fn pad(&mut self, n: usize) {
        for _ in 0..n {
            self.u8(0);
        }
    }
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}
impl<'a> RecordReader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        arr
    }

    fn u8(&mut self) -> u8 { self.take::<1>()[0] }

    fn u16(&mut self) -> u16 { u16::from_le_bytes(self.take()) }

    fn u32(&mut self) -> u32 { u32::from_le_bytes(self.take()) }

    fn u64(&mut self) -> u64 { u64::from_le_bytes(self.take()) }

    fn f32(&mut self) -> f32 { f32::from_bits(self.u32()) }

    fn skip(&mut self, n: usize) { self.pos += n; }
}

pub fn record_crc(bytes: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(&bytes[..CRC_OFFSET]);
    digest.sum32()
}

pub fn encode(cp: &Checkpoint) -> [u8; RECORD_LEN] {
    let mut w = RecordWriter::new();
    let r = &cp.result;

    w.u32(CHECKPOINT_MAGIC);
    w.u16(CHECKPOINT_VERSION);
    w.u8(cp.test_status.to_u8().unwrap_or(0));
    w.pad(1);

    let b = &r.baseline;
    w.f32(b.erase_time_avg);
    w.f32(b.program_time_avg);
    w.f32(b.read_speed);
    w.f32(b.error_rate);
    w.u64(b.unique_id);

    w.u32(r.total_cycles);
    w.u32(r.current_cycle);
    w.u32(r.verify_passes);
    w.u32(r.erase_errors);
    w.u32(r.program_errors);
    w.u32(r.bad_block_count);
    w.u32(r.read_disturb_errors);
    w.u64(r.total_bytes_written);
    w.u64(r.verify_errors);
    w.f32(r.erase_time_avg);
    w.f32(r.erase_time_current);
    w.f32(r.erase_time_min);
    w.f32(r.erase_time_max);
    w.f32(r.program_time_avg);
    w.f32(r.read_speed);
    w.f32(r.error_rate);
    w.f32(r.erase_degradation_rate);
    w.f32(r.program_degradation_rate);
    w.f32(r.read_speed_degradation_rate);
    w.f32(r.telomere_progress);
    w.u8(r.chip_status.to_u8().unwrap_or(0));
    w.u8(r.baseline_recorded as u8);
    w.u8(r.chip_dead as u8);
    w.pad(1);

    let d = cp.dead_data.unwrap_or_default();
    w.u32(d.dead_cycle);
    w.u32(d.erase_errors_final);
    w.u32(d.program_errors_final);
    w.u32(d.bad_block_count_final);
    w.u64(d.verify_errors_final);
    w.u64(d.total_bytes_written_final);
    w.f32(d.erase_time_final);
    w.f32(d.program_time_final);
    w.f32(d.read_speed_final);
    w.f32(d.error_rate_final);
    w.f32(d.telomere_progress_final);
    w.u8(d.chip_status_final.to_u8().unwrap_or(0));
    w.pad(3);

    w.u8(cp.dead_data.is_some() as u8);
    w.pad(3);

    debug_assert_eq!(w.pos, CRC_OFFSET);
    let crc = record_crc(&w.buf);
    w.u32(crc);
    w.buf
}

/// Why a record was rejected. All of these mean "start fresh", not an I/O failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordError {
    Short,
    /// erased or foreign data
    BadMagic(u32),
    BadVersion(u16),
    BadCrc { stored: u32, computed: u32 },
    /// an enum field holds a value this version never writes
    BadField,
}

pub fn decode(bytes: &[u8]) -> Result<Checkpoint, RecordError> {
    if bytes.len() < RECORD_LEN {
        return Err(RecordError::Short);
    }
    let mut r = RecordReader { buf: bytes, pos: 0 };
    let magic = r.u32();
    if magic != CHECKPOINT_MAGIC {
        return Err(RecordError::BadMagic(magic));
    }
    let version = r.u16();
    if version != CHECKPOINT_VERSION {
        return Err(RecordError::BadVersion(version));
    }
    let stored = u32::from_le_bytes([bytes[CRC_OFFSET], bytes[CRC_OFFSET + 1], bytes[CRC_OFFSET + 2], bytes[CRC_OFFSET + 3]]);
    let computed = record_crc(bytes);
    if stored != computed {
        return Err(RecordError::BadCrc { stored, computed });
    }
    let test_status = TestStatus::from_u8(r.u8()).ok_or(RecordError::BadField)?;
    r.skip(1);

    let baseline = Baseline {
        erase_time_avg: r.f32(),
        program_time_avg: r.f32(),
        read_speed: r.f32(),
        error_rate: r.f32(),
        unique_id: r.u64(),
    };

    let mut result = TestResult::new();
    result.baseline = baseline;
    result.total_cycles = r.u32();
    result.current_cycle = r.u32();
    result.verify_passes = r.u32();
    result.erase_errors = r.u32();
    result.program_errors = r.u32();
    result.bad_block_count = r.u32();
    result.read_disturb_errors = r.u32();
    result.total_bytes_written = r.u64();
    result.verify_errors = r.u64();
    result.erase_time_avg = r.f32();
    result.erase_time_current = r.f32();
    result.erase_time_min = r.f32();
    result.erase_time_max = r.f32();
    result.program_time_avg = r.f32();
    result.read_speed = r.f32();
    result.error_rate = r.f32();
    result.erase_degradation_rate = r.f32();
    result.program_degradation_rate = r.f32();
    result.read_speed_degradation_rate = r.f32();
    result.telomere_progress = r.f32();
    result.chip_status = ChipStatus::from_u8(r.u8()).ok_or(RecordError::BadField)?;
    result.baseline_recorded = r.u8() != 0;
    result.chip_dead = r.u8() != 0;
    r.skip(1);

    let dead_cycle = r.u32();
    let erase_errors_final = r.u32();
    let program_errors_final = r.u32();
    let bad_block_count_final = r.u32();
    let verify_errors_final = r.u64();
    let total_bytes_written_final = r.u64();
    let dead = DeadData {
        dead_cycle,
        erase_errors_final,
        program_errors_final,
        bad_block_count_final,
        verify_errors_final,
        total_bytes_written_final,
        erase_time_final: r.f32(),
        program_time_final: r.f32(),
        read_speed_final: r.f32(),
        error_rate_final: r.f32(),
        telomere_progress_final: r.f32(),
        chip_status_final: ChipStatus::from_u8(r.u8()).ok_or(RecordError::BadField)?,
    };
    r.skip(3);
    let dead_recorded = r.u8() != 0;

    Ok(Checkpoint { test_status, result, dead_data: if dead_recorded { Some(dead) } else { None } })
}

fn read_raw<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<[u8; RECORD_LEN], EnduranceError> {
    let mut raw = [0u8; RECORD_LEN];
    flash.read(CHECKPOINT_ADDR, &mut raw)?;
    Ok(raw)
}

fn parse_raw(raw: &[u8]) -> Option<Checkpoint> {
    match decode(raw) {
        Ok(cp) => Some(cp),
        Err(RecordError::BadMagic(m)) => {
            log::debug!(target: "endurance::checkpoint", "no checkpoint (magic {:08x})", m);
            None
        }
        Err(e) => {
            log::warn!(target: "endurance::checkpoint", "ignoring checkpoint record: {:?}", e);
            None
        }
    }
}

/// Read the checkpoint. `Ok(None)` means there is no valid record and the test starts from zero;
/// `Err` is reserved for a failed read.
pub fn load<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<Option<Checkpoint>, EnduranceError> {
    let raw = read_raw(flash)?;
    Ok(parse_raw(&raw))
}

/// Program `data` at `addr`, splitting on page boundaries and waiting out each page.
pub(crate) fn program<F: FlashDevice + ?Sized>(flash: &mut F, addr: u32, data: &[u8]) -> Result<(), FlashError> {
    let page = flash.device_info().page_size as usize;
    let mut offset = 0;
    let mut cur = addr;
    while offset < data.len() {
        let room = page - (cur as usize % page);
        let len = room.min(data.len() - offset);
        flash.write(cur, &data[offset..offset + len])?;
        flash.wait_ready(PROGRAM_TIMEOUT_MS)?;
        offset += len;
        cur += len as u32;
    }
    Ok(())
}

/// Persist `result`.
///
/// Reads the existing record first: dead data that is already on flash wins over
/// `dead_data`, and so does an already-recorded baseline. The sector is erased only
/// if it doesn't already read blank. The body goes down before the header.
pub fn save<F: FlashDevice + ?Sized>(
    flash: &mut F,
    result: &TestResult,
    dead_data: Option<&DeadData>,
) -> Result<Checkpoint, EnduranceError> {
    let raw = read_raw(flash)?;
    let mut cp = Checkpoint::new(result, dead_data);
    if let Some(existing) = parse_raw(&raw) {
        if existing.dead_data.is_some() {
            if cp.dead_data.is_some() && cp.dead_data != existing.dead_data {
                log::warn!(target: "endurance::checkpoint", "dead data already recorded, keeping the original");
            }
            cp.dead_data = existing.dead_data;
        }
        if existing.result.baseline_recorded && cp.result.baseline != existing.result.baseline {
            log::warn!(target: "endurance::checkpoint", "baseline already recorded, keeping the original");
            cp.result.baseline = existing.result.baseline;
            cp.result.baseline_recorded = true;
        }
    }
    let record = encode(&cp);

    if raw.iter().any(|&b| b != 0xFF) {
        flash.erase_sector(CHECKPOINT_ADDR)?;
        flash.wait_ready(SECTOR_ERASE_TIMEOUT_MS)?;
    }
    program(flash, CHECKPOINT_ADDR + HEADER_LEN as u32, &record[HEADER_LEN..])?;
    program(flash, CHECKPOINT_ADDR, &record[..HEADER_LEN])?;
    log::trace!(target: "endurance::checkpoint", "checkpoint saved at cycle {}", cp.result.total_cycles);
    Ok(cp)
}

/// Erase the checkpoint sector, discarding any record (including recorded dead data).
pub fn clear<F: FlashDevice + ?Sized>(flash: &mut F) -> Result<(), EnduranceError> {
    flash.erase_sector(CHECKPOINT_ADDR)?;
    flash.wait_ready(SECTOR_ERASE_TIMEOUT_MS)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::{EmuFlash, SimClock};

    fn sample_result() -> TestResult {
        let mut r = TestResult::new();
        r.total_cycles = 42;
        r.current_cycle = 42;
        r.verify_passes = 42;
        r.total_bytes_written = 42 * 0x3_0000;
        r.erase_time_avg = 1234.5;
        r.erase_time_current = 1240.25;
        r.erase_time_min = 1200.0;
        r.erase_time_max = 1300.75;
        r.program_time_avg = 0.7;
        r.read_speed = 2048.5;
        r.erase_errors = 1;
        r.program_errors = 2;
        r.verify_errors = 0x1_0000_0003;
        r.bad_block_count = 1;
        r.read_disturb_errors = 3;
        r.error_rate = 1.5e-4;
        r.erase_degradation_rate = 12.5;
        r.telomere_progress = 0.042;
        r.chip_status = ChipStatus::Warning;
        r.baseline = Baseline { erase_time_avg: 1100.0, program_time_avg: 0.6, read_speed: 2100.0, error_rate: 0.0, unique_id: 0 };
        r.baseline_recorded = true;
        r
    }

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_LEN, 188);
        assert!(RECORD_LEN <= 256, "record must fit in one page of a typical part");
    }

    #[test]
    fn test_encode_decode() {
        let r = sample_result();
        let mut dead_result = r;
        dead_result.declare_dead();
        let dead = DeadData::capture(&dead_result);
        for cp in [Checkpoint::new(&r, None), Checkpoint::new(&dead_result, Some(&dead))].iter() {
            let bytes = encode(cp);
            assert_eq!(&bytes[..4], &CHECKPOINT_MAGIC.to_le_bytes());
            assert_eq!(decode(&bytes), Ok(*cp));
        }
    }

    #[test]
    fn test_rejects_foreign_records() {
        let cp = Checkpoint::new(&sample_result(), None);
        let blank = [0xFFu8; RECORD_LEN];
        assert_eq!(decode(&blank), Err(RecordError::BadMagic(0xFFFF_FFFF)));
        assert_eq!(decode(&blank[..10]), Err(RecordError::Short));

        let mut old = encode(&cp);
        old[4] = 0x01;
        old[5] = 0x00;
        assert_eq!(decode(&old), Err(RecordError::BadVersion(1)));

        // a flipped bit in the baseline is caught even though magic and version are fine
        let mut flipped = encode(&cp);
        flipped[HEADER_LEN + 1] ^= 0x10;
        assert!(matches!(decode(&flipped), Err(RecordError::BadCrc { .. })));
    }

    #[test]
    fn test_load_blank_is_none() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        assert_eq!(load(&mut flash), Ok(None));
    }

    #[test]
    fn test_save_load_and_idempotence() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        let r = sample_result();
        let saved = save(&mut flash, &r, None).unwrap();
        assert_eq!(load(&mut flash).unwrap(), Some(saved));
        assert_eq!(saved.result, r);
        let once = flash.read_range(CHECKPOINT_ADDR, RECORD_LEN);
        save(&mut flash, &r, None).unwrap();
        let twice = flash.read_range(CHECKPOINT_ADDR, RECORD_LEN);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_dead_data_is_never_overwritten() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        let mut r = sample_result();
        r.declare_dead();
        let first = DeadData::capture(&r);
        save(&mut flash, &r, Some(&first)).unwrap();

        let mut later = r;
        later.total_cycles += 5;
        let second = DeadData::capture(&later);
        let cp = save(&mut flash, &later, Some(&second)).unwrap();
        assert_eq!(cp.dead_data, Some(first));
        // and a save without dead data still keeps it
        let cp = save(&mut flash, &later, None).unwrap();
        assert_eq!(cp.dead_data, Some(first));
        assert_eq!(load(&mut flash).unwrap().unwrap().dead_data, Some(first));
        assert_eq!(cp.test_status, TestStatus::Completed);
    }

    #[test]
    fn test_baseline_is_never_overwritten() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        let r = sample_result();
        save(&mut flash, &r, None).unwrap();
        let mut tampered = r;
        tampered.baseline.erase_time_avg = 1.0;
        let cp = save(&mut flash, &tampered, None).unwrap();
        assert_eq!(cp.result.baseline, r.baseline);
    }

    #[test]
    fn test_header_written_last() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        // lose power right after the body is programmed: the header write never lands
        flash.cut_power_after_writes(1);
        assert!(save(&mut flash, &sample_result(), None).is_err());
        flash.restore_power();
        assert_eq!(load(&mut flash), Ok(None));
    }

    #[test]
    fn test_clear() {
        let mut flash = EmuFlash::new(EmuFlash::small_geometry(), SimClock::new());
        save(&mut flash, &sample_result(), None).unwrap();
        clear(&mut flash).unwrap();
        assert_eq!(load(&mut flash), Ok(None));
    }
}
