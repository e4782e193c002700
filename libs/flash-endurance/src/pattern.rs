/// Fill `buffer` with the cycle's fill byte, `cycle_index mod 256`.
///
/// A uniform value per cycle makes any flipped bit stand out against both the
/// erased state and the previous cycle's data.
pub fn generate(buffer: &mut [u8], cycle_index: u32) {
    let fill = fill_byte(cycle_index);
    for b in buffer.iter_mut() {
        *b = fill;
    }
}

pub fn fill_byte(cycle_index: u32) -> u8 { (cycle_index & 0xFF) as u8 }

/// Number of bits that differ between `expected` and `actual`. Only the common prefix is compared.
pub fn count_bit_errors(expected: &[u8], actual: &[u8]) -> u32 {
    expected.iter().zip(actual.iter()).map(|(&e, &a)| (e ^ a).count_ones()).sum()
}

/// Bit errors of a page that had faults injected, split by origin.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PageErrors {
    /// errors at offsets that were deliberately corrupted
    pub injected: u32,
    /// errors everywhere else; these are the chip's own
    pub normal: u32,
}
impl PageErrors {
    pub fn total(&self) -> u32 { self.injected + self.normal }
}

/// Count bit errors, attributing those at `injected_offsets` (page-relative, sorted or not)
/// separately from the rest of the page.
pub fn count_split_errors(expected: &[u8], actual: &[u8], injected_offsets: &[usize]) -> PageErrors {
    let mut errors = PageErrors::default();
    for (offset, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let bits = (e ^ a).count_ones();
        if bits == 0 {
            continue;
        }
        if injected_offsets.contains(&offset) {
            errors.injected += bits;
        } else {
            errors.normal += bits;
        }
    }
    errors
}
