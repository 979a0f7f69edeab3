use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::term::{Config, Term};
use alacritty_terminal::vte::ansi::{self, Rgb as AlacRgb};

use crate::screen::{convert_cursor_shape, palette_rgb, CursorState, ScreenSnapshot, ScreenView};

/// Receives bytes the terminal must send back to the child, such as replies
/// to cursor-position and device-attribute queries.
///
/// Called synchronously from inside [`TerminalState::feed`], so it must not
/// block and must not call back into the terminal.
pub type WriteBack = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Lines of scrollback kept when no explicit size is given.
pub const DEFAULT_SCROLLBACK: usize = 10_000;

type ColorFormatter = Arc<dyn Fn(AlacRgb) -> String + Send + Sync>;

/// A reply raised while the parser holds the grid.
enum PendingReply {
    Bytes(String),
    /// OSC 4/10/11/12 query, answered once the palette is readable again.
    Color(usize, ColorFormatter),
}

#[derive(Default)]
struct EventState {
    title: Option<String>,
    bell: bool,
    replies: Vec<PendingReply>,
}

/// Event listener handed to alacritty's `Term`.
///
/// Replies are queued in arrival order and flushed to the write-back function
/// at the end of each feed; title and bell changes are recorded for the host
/// to pick up.
#[derive(Clone)]
pub struct EventProxy {
    state: Arc<Mutex<EventState>>,
    write_back: WriteBack,
}

impl EventProxy {
    fn new(write_back: WriteBack) -> Self {
        Self {
            state: Arc::new(Mutex::new(EventState::default())),
            write_back,
        }
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reply(&self, data: &str) {
        log::trace!("terminal reply: {data:?}");
        (self.write_back)(data.as_bytes());
    }
}

impl EventListener for EventProxy {
    fn send_event(&self, event: Event) {
        match event {
            Event::PtyWrite(data) => self.state().replies.push(PendingReply::Bytes(data)),
            Event::ColorRequest(index, format) => {
                self.state().replies.push(PendingReply::Color(index, format))
            }
            Event::Title(title) => self.state().title = Some(title),
            Event::ResetTitle => self.state().title = None,
            Event::Bell => self.state().bell = true,
            _ => {}
        }
    }
}

struct TermSize {
    columns: usize,
    screen_lines: usize,
}

impl TermSize {
    fn new(rows: u16, cols: u16) -> Self {
        Self {
            columns: cols.max(1) as usize,
            screen_lines: rows.max(1) as usize,
        }
    }
}

impl Dimensions for TermSize {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

/// Screen model for one embedded terminal.
///
/// Owns the parser and grid. Output text goes in through [`feed`](Self::feed);
/// anything the child asked the terminal to answer comes out through the
/// [`WriteBack`] given at construction.
pub struct TerminalState {
    term: Term<EventProxy>,
    parser: ansi::Processor,
    event_proxy: EventProxy,
}

impl TerminalState {
    pub fn new(rows: u16, cols: u16, write_back: WriteBack) -> Self {
        Self::with_scrollback(rows, cols, DEFAULT_SCROLLBACK, write_back)
    }

    pub fn with_scrollback(rows: u16, cols: u16, scrollback: usize, write_back: WriteBack) -> Self {
        let config = Config {
            scrolling_history: scrollback,
            ..Config::default()
        };

        let event_proxy = EventProxy::new(write_back);
        let term = Term::new(config, &TermSize::new(rows, cols), event_proxy.clone());

        Self {
            term,
            parser: ansi::Processor::new(),
            event_proxy,
        }
    }

    /// Feed decoded child output into the model.
    pub fn feed(&mut self, text: &str) {
        self.feed_bytes(text.as_bytes());
    }

    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.term, bytes);
        self.flush_replies();
    }

    fn flush_replies(&mut self) {
        let replies = std::mem::take(&mut self.event_proxy.state().replies);
        for reply in replies {
            match reply {
                PendingReply::Bytes(data) => self.event_proxy.reply(&data),
                PendingReply::Color(index, format) => {
                    self.event_proxy.reply(&format(self.color(index)))
                }
            }
        }
    }

    /// Palette entry `index`, honouring OSC 4 overrides.
    fn color(&self, index: usize) -> AlacRgb {
        self.term.colors()[index].unwrap_or_else(|| {
            let rgb = palette_rgb(index);
            AlacRgb {
                r: rgb.r,
                g: rgb.g,
                b: rgb.b,
            }
        })
    }

    /// Reflow the grid to new dimensions.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.term.resize(TermSize::new(rows, cols));
    }

    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    /// Current geometry as `(rows, cols)`.
    pub fn size(&self) -> (u16, u16) {
        (self.rows(), self.cols())
    }

    pub fn screen(&self) -> ScreenView<'_> {
        ScreenView::new(&self.term)
    }

    pub fn cursor(&self) -> CursorState {
        let cursor = self.term.renderable_content().cursor;
        CursorState {
            row: cursor.point.line.0.max(0) as u16,
            col: cursor.point.column.0 as u16,
            shape: convert_cursor_shape(cursor.shape),
            visible: cursor.shape != ansi::CursorShape::Hidden,
        }
    }

    /// Window title set through OSC 0/2, if any.
    pub fn title(&self) -> Option<String> {
        self.event_proxy.state().title.clone()
    }

    /// Returns `true` if the bell rang since the last call, clearing it.
    pub fn take_bell(&mut self) -> bool {
        std::mem::take(&mut self.event_proxy.state().bell)
    }

    /// Owned copy of the visible grid, cursor and title.
    pub fn snapshot(&self) -> ScreenSnapshot {
        ScreenSnapshot::capture(&self.screen(), self.cursor(), self.title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellFlags, DEFAULT_FG};

    fn recorder() -> (WriteBack, Arc<Mutex<Vec<String>>>) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replies);
        let write_back: WriteBack = Arc::new(move |data: &[u8]| {
            let reply = String::from_utf8_lossy(data).into_owned();
            sink.lock().unwrap().push(reply);
        });
        (write_back, replies)
    }

    fn silent(rows: u16, cols: u16) -> TerminalState {
        TerminalState::new(rows, cols, Arc::new(|_: &[u8]| {}))
    }

    #[test]
    fn test_create_terminal_dimensions() {
        let term = silent(24, 80);
        assert_eq!(term.size(), (24, 80));
        assert_eq!(term.screen().cols(), 80);
        assert_eq!(term.screen().rows(), 24);
    }

    #[test]
    fn test_feed_text() {
        let mut term = silent(24, 80);
        term.feed("hello");

        let screen = term.screen();
        assert_eq!(screen.cell(0, 0).codepoint, 'h');
        assert_eq!(screen.cell(0, 4).codepoint, 'o');
        assert_eq!(screen.cell(0, 5).codepoint, ' ');
        assert_eq!(screen.row_text(0), "hello");
    }

    #[test]
    fn test_ansi_color_escape() {
        let mut term = silent(24, 80);
        term.feed("\x1b[31mR");

        let cell = term.screen().cell(0, 0);
        assert_eq!(cell.codepoint, 'R');
        assert_ne!(cell.fg, DEFAULT_FG);
    }

    #[test]
    fn test_bold_flag() {
        let mut term = silent(24, 80);
        term.feed("\x1b[1mB");

        let cell = term.screen().cell(0, 0);
        assert!(cell.flags.contains(CellFlags::BOLD));
    }

    #[test]
    fn test_resize_terminal() {
        let mut term = silent(24, 80);
        term.resize(40, 120);
        assert_eq!(term.size(), (40, 120));
    }

    #[test]
    fn test_cursor_position_multiline() {
        let mut term = silent(5, 10);
        term.feed("0123456789AB");

        let cursor = term.cursor();
        assert_eq!(cursor.row, 1);
        assert_eq!(cursor.col, 2);
        assert!(cursor.visible);
    }

    #[test]
    fn test_title_and_bell() {
        let mut term = silent(24, 80);
        term.feed("\x1b]0;My Terminal\x07");
        assert_eq!(term.title(), Some("My Terminal".to_string()));

        assert!(!term.take_bell());
        term.feed("\x07");
        assert!(term.take_bell());
        assert!(!term.take_bell());
    }

    #[test]
    fn test_cursor_position_report_at_origin() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("\x1b[6n");

        assert_eq!(*replies.lock().unwrap(), vec!["\x1b[1;1R".to_string()]);
    }

    #[test]
    fn test_cursor_position_report_after_move() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("\x1b[5;10H");
        term.feed("\x1b[6n");

        assert_eq!(*replies.lock().unwrap(), vec!["\x1b[5;10R".to_string()]);
    }

    #[test]
    fn test_device_status_ok() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("\x1b[5n");

        assert_eq!(*replies.lock().unwrap(), vec!["\x1b[0n".to_string()]);
    }

    #[test]
    fn test_device_attributes() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("\x1b[c");

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("\x1b[?"));
    }

    #[test]
    fn test_color_query_sees_palette_override() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("\x1b]4;1;rgb:12/34/56\x07");
        term.feed("\x1b]4;1;?\x07\x1b[6n");

        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies[0].starts_with("\x1b]4;1;rgb:1212/3434/5656"), "got {replies:?}");
        assert_eq!(replies[1], "\x1b[1;1R");
    }

    #[test]
    fn test_plain_output_produces_no_replies() {
        let (write_back, replies) = recorder();
        let mut term = TerminalState::new(24, 80, write_back);
        term.feed("$ ls\r\nfile.txt\r\n");

        assert!(replies.lock().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut term = silent(3, 10);
        term.feed("one\r\ntwo");
        let snapshot = term.snapshot();
        term.feed("\r\nthree");

        assert_eq!(snapshot.text(), "one\ntwo");
        assert_eq!(snapshot.cursor.row, 1);
        assert_eq!(snapshot.cursor.col, 3);
        assert_eq!(term.snapshot().row_text(2), "three");
    }
}
