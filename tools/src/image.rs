//! Flash images on disk. An image is the raw chip contents, byte for byte.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use flash_endurance::checkpoint;
use flash_endurance::hosted::{EmuFlash, SimClock};
use flash_endurance::DeviceInfo;

/// Open an image as an emulated chip. A missing file is a blank (erased) chip.
///
/// The emulator's erase history is picked up from the image's checkpoint, so a worn part
/// keeps wearing where it left off.
pub fn open(path: &Path, info: DeviceInfo, clock: SimClock, rated_cycles: Option<u32>) -> io::Result<EmuFlash> {
    let data = match fs::read(path) {
        Ok(data) => {
            if data.len() != info.capacity as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} is {} bytes, expected {}", path.display(), data.len(), info.capacity),
                ));
            }
            data
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("{} doesn't exist, starting with a blank chip", path.display());
            vec![0xFF; info.capacity as usize]
        }
        Err(e) => return Err(e),
    };

    let erases = match checkpoint::decode(&data) {
        Ok(cp) => cp.result.total_cycles,
        Err(_) => 0,
    };
    let mut flash = EmuFlash::from_image(info, clock, data);
    if let Some(rated) = rated_cycles {
        flash = flash.with_wear(rated);
    }
    flash.set_chip_erases(erases);
    Ok(flash)
}

/// Write the chip contents back. The old image is replaced only once the new one is complete.
pub fn store(path: &Path, flash: &EmuFlash) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(flash.image())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}
