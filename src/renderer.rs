//! Overlays the accumulated suggestion after the cursor using raw terminal
//! control, without disturbing the editor's own cursor state. Terminal I/O
//! goes through `crossterm` rather than hand-rolled `termios`/`write(2)`
//! calls.

use std::io::{self, Read, Write};

use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::error::CopilotError;

/// RAII guard restoring terminal attributes on every exit path — including
/// early returns via `?` — matching the invariant that raw mode is never
/// left enabled if the overlay aborts partway through.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self, CopilotError> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Renders ghost text after the cursor, tracking how many terminal rows the
/// previous overlay occupied so it can be erased cleanly before the next
/// repaint.
pub struct GhostRenderer {
    ghost_rows: u16,
}

impl Default for GhostRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl GhostRenderer {
    pub fn new() -> Self {
        Self { ghost_rows: 0 }
    }

    /// Replaces the editor's default redraw function. `native_redisplay` is
    /// the editor's own, unmodified paint routine.
    pub fn redraw(
        &mut self,
        suggestion: &str,
        mut native_redisplay: impl FnMut(),
    ) -> Result<(), CopilotError> {
        let mut stdout = io::stdout();
        self.erase_prior_ghost(&mut stdout)?;

        native_redisplay();
        stdout.flush()?;

        if suggestion.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.paint_overlay(&mut stdout, suggestion) {
            // Failure mode: abort the overlay, leave the editor's own
            // output intact. Raw mode is already restored by RawModeGuard.
            self.ghost_rows = 0;
            return Err(e);
        }
        Ok(())
    }

    /// Erase `N` ghost rows drawn by the previous call, then clear and
    /// home the current row.
    fn erase_prior_ghost(&mut self, out: &mut impl Write) -> Result<(), CopilotError> {
        if self.ghost_rows > 0 {
            write!(out, "\x1b[{}B", self.ghost_rows)?;
            for _ in 0..self.ghost_rows {
                write!(out, "\x1b[2K\x1b[A")?;
            }
        }
        write!(out, "\x1b[2K\r")?;
        self.ghost_rows = 0;
        out.flush()?;
        Ok(())
    }

    fn paint_overlay(&mut self, out: &mut impl Write, suggestion: &str) -> Result<(), CopilotError> {
        out.flush()?;
        let _raw = RawModeGuard::enable()?;

        // Save cursor, probe width via column 9999 (terminal clamps to the
        // right edge), restore, probe pre-suggestion position, write the
        // dimmed suggestion, reset color, probe the post-suggestion row.
        write!(out, "\x1b[s\x1b[;9999H\x1b[6n\x1b[u\x1b[6n")?;
        write!(out, "{}", SetForegroundColor(Color::DarkGrey))?;
        write!(out, "{suggestion}")?;
        write!(out, "{}", ResetColor)?;
        write!(out, "\x1b[6n")?;
        out.flush()?;

        let mut stdin = io::stdin();
        let (_, width) = read_cursor_report(&mut stdin)?;
        let (row1, col1) = read_cursor_report(&mut stdin)?;
        let (row2, _) = read_cursor_report(&mut stdin)?;

        let row3 = compute_top_row(suggestion, width, row2);
        self.ghost_rows = row2.saturating_sub(row3);

        write!(out, "\x1b[{row3};{col1}H")?;
        out.flush()?;
        let _ = row1; // only used to anchor col1 semantically; row3 is authoritative
        Ok(())
    }
}

/// Read one `\x1b[<row>;<col>R` cursor-position report from `input`.
/// Any unexpected byte aborts the overlay rather than guessing.
fn read_cursor_report(input: &mut impl Read) -> Result<(u16, u16), CopilotError> {
    #[derive(Clone, Copy)]
    enum State {
        Esc,
        Bracket,
        Row,
        Col,
    }

    let mut state = State::Esc;
    let mut row: u32 = 0;
    let mut col: u32 = 0;
    let mut byte = [0u8; 1];

    loop {
        input
            .read_exact(&mut byte)
            .map_err(|e| CopilotError::CursorReport(e.to_string()))?;
        let c = byte[0] as char;
        match state {
            State::Esc => {
                if c == '\x1b' {
                    state = State::Bracket;
                } else {
                    return Err(CopilotError::CursorReport(format!(
                        "expected ESC, got {c:?}"
                    )));
                }
            }
            State::Bracket => {
                if c == '[' {
                    state = State::Row;
                } else {
                    return Err(CopilotError::CursorReport(format!(
                        "expected '[', got {c:?}"
                    )));
                }
            }
            State::Row => {
                if c == ';' {
                    state = State::Col;
                } else if c.is_ascii_digit() {
                    row = row * 10 + (c as u32 - '0' as u32);
                } else {
                    return Err(CopilotError::CursorReport(format!(
                        "expected digit or ';', got {c:?}"
                    )));
                }
            }
            State::Col => {
                if c == 'R' {
                    return Ok((row as u16, col as u16));
                } else if c.is_ascii_digit() {
                    col = col * 10 + (c as u32 - '0' as u32);
                } else {
                    return Err(CopilotError::CursorReport(format!(
                        "expected digit or 'R', got {c:?}"
                    )));
                }
            }
        }
    }
}

/// Walk the suggestion from end to start, counting visible columns per
/// logical line (newlines reset the counter). Each completed line
/// contributes `chars/width + 1` rows of backward movement (the `+1`
/// accounts for crossing the newline itself); the trailing, still-open
/// segment contributes `chars/width` rows. Clamped to `>= 1` since the top
/// of a long suggestion may have scrolled off-screen.
fn compute_top_row(suggestion: &str, width: u16, row2: u16) -> u16 {
    let width = width.max(1) as i64;
    let mut chars_on_line: i64 = 0;
    let mut row3: i64 = row2 as i64;

    for ch in suggestion.chars().rev() {
        if ch == '\n' {
            row3 -= chars_on_line / width + 1;
            chars_on_line = 0;
        } else {
            chars_on_line += 1;
        }
    }
    row3 -= chars_on_line / width;

    row3.max(1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_suggestion_within_width() {
        // "SELECT" is 6 chars, width 80: no wrapping, stays on the same row.
        let row3 = compute_top_row("SELECT", 80, 10);
        assert_eq!(row3, 10);
    }

    #[test]
    fn wrapped_single_line_consumes_extra_rows() {
        // 85 chars at width 40 wraps across 3 rows (40+40+5); row2 is the
        // last of those, so top should be 2 rows above it.
        let suggestion = "x".repeat(85);
        let row3 = compute_top_row(&suggestion, 40, 12);
        assert_eq!(row3, 10);
    }

    #[test]
    fn multiline_suggestion_counts_each_logical_line() {
        let suggestion = "abc\ndef\nghi";
        // 3 logical lines at width 80, each far under width: bottom line
        // ("ghi") occupies row2; each prior "\n" crossing moves up one row.
        let row3 = compute_top_row(suggestion, 80, 10);
        assert_eq!(row3, 8);
    }

    #[test]
    fn clamps_to_one_when_scrolled_off() {
        let suggestion = "x".repeat(1000);
        let row3 = compute_top_row(&suggestion, 80, 3);
        assert_eq!(row3, 1);
    }

    #[test]
    fn empty_suggestion_consumes_no_rows() {
        let row3 = compute_top_row("", 80, 5);
        assert_eq!(row3, 5);
    }

    #[test]
    fn read_cursor_report_parses_well_formed_sequence() {
        let mut input: &[u8] = b"\x1b[24;80R";
        let (row, col) = read_cursor_report(&mut input).unwrap();
        assert_eq!((row, col), (24, 80));
    }

    #[test]
    fn read_cursor_report_rejects_malformed_sequence() {
        let mut input: &[u8] = b"not-a-csi-sequence";
        assert!(read_cursor_report(&mut input).is_err());
    }

    #[test]
    fn read_cursor_report_rejects_truncated_sequence() {
        let mut input: &[u8] = b"\x1b[24;8";
        assert!(read_cursor_report(&mut input).is_err());
    }

    #[test]
    fn renderer_starts_with_no_ghost_rows() {
        let renderer = GhostRenderer::new();
        assert_eq!(renderer.ghost_rows, 0);
    }
}
