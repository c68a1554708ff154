//! In-memory terminal emulator for snapshot generation.
//! Every byte broadcast to clients passes through here first, so a late
//! joiner can be caught up from a repaint of the current screen instead of a
//! full history replay.

use vt100::{Color, Parser};

/// xterm-compatible screen model sized (rows, cols).
pub struct VirtualTerminal {
    parser: Parser,
}

impl VirtualTerminal {
    /// Scrollback is kept in the session ring buffer, not the emulator.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Parser::new(rows, cols, 0),
        }
    }

    /// Advance the screen model by raw PTY bytes (escape sequences included).
    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn set_size(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Current (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        self.parser.screen().size()
    }

    /// Current cursor position, zero-based (row, col).
    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Render a byte sequence that, applied to a freshly cleared terminal of
    /// the same size, reproduces the current cell grid and cursor position.
    ///
    /// Starts with clear-screen + home, repaints row by row emitting fg/bg
    /// changes only when they differ from the previous cell, and ends with an
    /// attribute reset plus cursor positioning.
    pub fn snapshot(&self) -> Vec<u8> {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let mut out = Vec::with_capacity(rows as usize * cols as usize * 2);
        out.extend_from_slice(b"\x1b[2J\x1b[H\x1b[0m");

        let mut fg = Color::Default;
        let mut bg = Color::Default;
        for row in 0..rows {
            out.extend_from_slice(format!("\x1b[{};1H", row + 1).as_bytes());
            for col in 0..cols {
                let cell = match screen.cell(row, col) {
                    Some(cell) => cell,
                    None => continue,
                };
                // Wide glyphs span two columns; the continuation cell is skipped.
                if cell.is_wide_continuation() {
                    continue;
                }
                if cell.fgcolor() != fg {
                    fg = cell.fgcolor();
                    push_fg(&mut out, fg);
                }
                if cell.bgcolor() != bg {
                    bg = cell.bgcolor();
                    push_bg(&mut out, bg);
                }
                let contents = cell.contents();
                if contents.is_empty() {
                    out.push(b' ');
                } else {
                    out.extend_from_slice(contents.as_bytes());
                }
            }
        }

        out.extend_from_slice(b"\x1b[0m");
        let (crow, ccol) = screen.cursor_position();
        out.extend_from_slice(format!("\x1b[{};{}H", crow + 1, ccol + 1).as_bytes());
        out
    }
}

fn push_fg(out: &mut Vec<u8>, color: Color) {
    match color {
        Color::Default => out.extend_from_slice(b"\x1b[39m"),
        Color::Idx(n) => out.extend_from_slice(format!("\x1b[38;5;{}m", n).as_bytes()),
        Color::Rgb(r, g, b) => {
            out.extend_from_slice(format!("\x1b[38;2;{};{};{}m", r, g, b).as_bytes())
        }
    }
}

fn push_bg(out: &mut Vec<u8>, color: Color) {
    match color {
        Color::Default => out.extend_from_slice(b"\x1b[49m"),
        Color::Idx(n) => out.extend_from_slice(format!("\x1b[48;5;{}m", n).as_bytes()),
        Color::Rgb(r, g, b) => {
            out.extend_from_slice(format!("\x1b[48;2;{};{};{}m", r, g, b).as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_same_screen(a: &VirtualTerminal, b: &VirtualTerminal) {
        let (sa, sb) = (a.parser.screen(), b.parser.screen());
        assert_eq!(sa.size(), sb.size());
        let (rows, cols) = sa.size();
        for row in 0..rows {
            for col in 0..cols {
                let (ca, cb) = (sa.cell(row, col).unwrap(), sb.cell(row, col).unwrap());
                let pos = (row, col);
                assert_eq!(ca.contents(), cb.contents(), "contents at {:?}", pos);
                assert_eq!(ca.fgcolor(), cb.fgcolor(), "fg at {:?}", pos);
                assert_eq!(ca.bgcolor(), cb.bgcolor(), "bg at {:?}", pos);
            }
        }
        assert_eq!(sa.cursor_position(), sb.cursor_position());
    }

    #[test]
    fn snapshot_reproduces_plain_text() {
        let mut vt = VirtualTerminal::new(24, 80);
        vt.process(b"hello\r\nworld");

        let mut fresh = VirtualTerminal::new(24, 80);
        fresh.process(&vt.snapshot());
        assert_same_screen(&vt, &fresh);
    }

    #[test]
    fn snapshot_reproduces_colors_and_cursor() {
        let mut vt = VirtualTerminal::new(24, 80);
        vt.process(b"\x1b[31mred\x1b[0m \x1b[38;5;42mgreenish\x1b[0m");
        vt.process(b"\x1b[44m blue bg \x1b[0m");
        vt.process(b"\x1b[5;10H");

        let mut fresh = VirtualTerminal::new(24, 80);
        fresh.process(&vt.snapshot());
        assert_same_screen(&vt, &fresh);
        assert_eq!(fresh.cursor_position(), (4, 9));
    }

    #[test]
    fn snapshot_reproduces_screen_after_clear_and_repaint() {
        let mut vt = VirtualTerminal::new(10, 40);
        vt.process(b"scrolled away\r\n\x1b[2J\x1b[H\x1b[33mbanner\x1b[0m\r\nline two");

        let mut fresh = VirtualTerminal::new(10, 40);
        fresh.process(&vt.snapshot());
        assert_same_screen(&vt, &fresh);
    }

    #[test]
    fn snapshot_starts_with_clear_and_home() {
        let mut vt = VirtualTerminal::new(24, 80);
        vt.process(b"x");
        let snap = vt.snapshot();
        assert!(snap.starts_with(b"\x1b[2J\x1b[H"));
    }

    #[test]
    fn resize_applies_to_screen_and_snapshot() {
        let mut vt = VirtualTerminal::new(24, 80);
        vt.process(b"before resize");
        vt.set_size(30, 100);
        assert_eq!(vt.size(), (30, 100));

        let mut fresh = VirtualTerminal::new(30, 100);
        fresh.process(&vt.snapshot());
        assert_same_screen(&vt, &fresh);
    }
}
