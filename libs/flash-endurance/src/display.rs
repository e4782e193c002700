use alloc::string::String;

pub const DISPLAY_COLUMNS: usize = 16;
pub const DISPLAY_ROWS: usize = 4;

/// Fire-and-forget status panel, e.g. a 128x64 OLED with a 16x4 character grid.
pub trait Display {
    /// `row` is 0-based; `text` is already fitted to `DISPLAY_COLUMNS`.
    fn show(&mut self, row: usize, text: &str);
}

/// Discards everything. The default when no panel is attached.
pub struct NullDisplay;
impl Display for NullDisplay {
    fn show(&mut self, _row: usize, _text: &str) {}
}

/// Mirrors the panel into the log, for headless runs.
pub struct LogDisplay;
impl Display for LogDisplay {
    fn show(&mut self, row: usize, text: &str) {
        log::info!(target: "endurance::display", "[{}] {}", row, text);
    }
}

/// Truncate or space-pad to exactly one panel line.
pub fn fit_line(text: &str) -> String {
    let mut line: String = text.chars().take(DISPLAY_COLUMNS).collect();
    while line.chars().count() < DISPLAY_COLUMNS {
        line.push(' ');
    }
    line
}

pub(crate) fn show_lines(display: &mut dyn Display, lines: &[&str]) {
    for (row, text) in lines.iter().enumerate().take(DISPLAY_ROWS) {
        display.show(row, &fit_line(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_line() {
        assert_eq!(fit_line("Chip Dead"), "Chip Dead       ");
        assert_eq!(fit_line("Total:12345.67GB extra"), "Total:12345.67GB");
        assert_eq!(fit_line("").len(), DISPLAY_COLUMNS);
    }
}
