use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::cell::{Cell, Flags as AlacFlags};
use alacritty_terminal::term::color::Colors;
use alacritty_terminal::term::Term;
use alacritty_terminal::vte::ansi::{Color, CursorShape as AlacCursorShape};

use crate::cell::{CellFlags, Rgb, VtCell, DEFAULT_BG, DEFAULT_FG};
use crate::terminal::EventProxy;

/// Current state of the cursor. `row` and `col` are zero based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub shape: CursorShape,
    pub visible: bool,
}

/// Shape of the terminal cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorShape {
    Block,
    Underline,
    Bar,
    Hidden,
}

/// A borrowed, read-only view into the live grid.
pub struct ScreenView<'a> {
    term: &'a Term<EventProxy>,
}

impl<'a> ScreenView<'a> {
    pub(crate) fn new(term: &'a Term<EventProxy>) -> Self {
        Self { term }
    }

    /// Number of visible rows.
    pub fn rows(&self) -> u16 {
        self.term.screen_lines() as u16
    }

    /// Number of columns.
    pub fn cols(&self) -> u16 {
        self.term.columns() as u16
    }

    /// Get a single cell. Row 0 is the top of the visible screen; positions
    /// outside the grid read as a default cell.
    pub fn cell(&self, row: u16, col: u16) -> VtCell {
        if (row as usize) >= self.term.screen_lines() || (col as usize) >= self.term.columns() {
            return VtCell::default();
        }

        let cell = &self.term.grid()[Line(row as i32)][Column(col as usize)];
        convert_cell(cell, self.term.colors())
    }

    /// Get all cells in a row.
    pub fn row_cells(&self, row: u16) -> Vec<VtCell> {
        (0..self.cols()).map(|col| self.cell(row, col)).collect()
    }

    /// Plain text of one row with trailing blanks removed.
    pub fn row_text(&self, row: u16) -> String {
        row_to_text(&self.row_cells(row))
    }
}

/// An owned copy of the screen, taken at a single point in time.
///
/// Renderers work from a snapshot so they never observe a grid that is
/// halfway through a `feed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenSnapshot {
    pub rows: u16,
    pub cols: u16,
    /// Row-major cells, `rows * cols` long.
    pub cells: Vec<VtCell>,
    pub cursor: CursorState,
    pub title: Option<String>,
}

impl ScreenSnapshot {
    pub(crate) fn capture(view: &ScreenView<'_>, cursor: CursorState, title: Option<String>) -> Self {
        let rows = view.rows();
        let cols = view.cols();
        let mut cells = Vec::with_capacity(rows as usize * cols as usize);
        for row in 0..rows {
            cells.extend(view.row_cells(row));
        }
        Self {
            rows,
            cols,
            cells,
            cursor,
            title,
        }
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&VtCell> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(row as usize * self.cols as usize + col as usize)
    }

    pub fn row(&self, row: u16) -> &[VtCell] {
        if row >= self.rows {
            return &[];
        }
        let start = row as usize * self.cols as usize;
        &self.cells[start..start + self.cols as usize]
    }

    /// Plain text of one row with trailing blanks removed.
    pub fn row_text(&self, row: u16) -> String {
        row_to_text(self.row(row))
    }

    /// Plain text of the whole screen, one line per row, with trailing empty
    /// rows dropped.
    pub fn text(&self) -> String {
        let mut lines: Vec<String> = (0..self.rows).map(|row| self.row_text(row)).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

fn row_to_text(cells: &[VtCell]) -> String {
    let text: String = cells
        .iter()
        .filter(|cell| !cell.is_spacer())
        .map(|cell| cell.codepoint)
        .collect();
    text.trim_end().to_string()
}

/// Standard xterm ANSI palette.
const ANSI_COLORS: [Rgb; 16] = [
    Rgb::new(0, 0, 0),       // Black
    Rgb::new(205, 0, 0),     // Red
    Rgb::new(0, 205, 0),     // Green
    Rgb::new(205, 205, 0),   // Yellow
    Rgb::new(0, 0, 238),     // Blue
    Rgb::new(205, 0, 205),   // Magenta
    Rgb::new(0, 205, 205),   // Cyan
    Rgb::new(229, 229, 229), // White
    Rgb::new(127, 127, 127), // Bright Black
    Rgb::new(255, 0, 0),     // Bright Red
    Rgb::new(0, 255, 0),     // Bright Green
    Rgb::new(255, 255, 0),   // Bright Yellow
    Rgb::new(92, 92, 255),   // Bright Blue
    Rgb::new(255, 0, 255),   // Bright Magenta
    Rgb::new(0, 255, 255),   // Bright Cyan
    Rgb::new(255, 255, 255), // Bright White
];

/// Dim variants, in `NamedColor::DimBlack..=DimWhite` order.
const DIM_COLORS: [Rgb; 8] = [
    Rgb::new(0, 0, 0),
    Rgb::new(154, 0, 0),
    Rgb::new(0, 154, 0),
    Rgb::new(154, 154, 0),
    Rgb::new(0, 0, 178),
    Rgb::new(154, 0, 154),
    Rgb::new(0, 154, 154),
    Rgb::new(178, 178, 178),
];

// Palette slots past the 256 indexed colors, as numbered by `NamedColor`.
const FOREGROUND: usize = 256;
const BACKGROUND: usize = 257;
const DIM_BLACK: usize = 259;
const DIM_WHITE: usize = 266;
const DIM_FOREGROUND: usize = 268;

/// Default color for a palette slot, ignoring any runtime overrides.
///
/// Slots 0..256 are the xterm indexed colors; higher slots follow
/// alacritty's `NamedColor` numbering.
pub fn palette_rgb(index: usize) -> Rgb {
    match index {
        0..=15 => ANSI_COLORS[index],
        16..=231 => {
            // 6x6x6 color cube.
            let n = index - 16;
            let to_byte = |v: usize| if v == 0 { 0u8 } else { (55 + 40 * v) as u8 };
            Rgb::new(to_byte(n / 36), to_byte((n / 6) % 6), to_byte(n % 6))
        }
        232..=255 => {
            let v = (8 + 10 * (index - 232)) as u8;
            Rgb::new(v, v, v)
        }
        BACKGROUND => DEFAULT_BG,
        DIM_BLACK..=DIM_WHITE => DIM_COLORS[index - DIM_BLACK],
        DIM_FOREGROUND => DIM_COLORS[7],
        FOREGROUND => DEFAULT_FG,
        _ => DEFAULT_FG,
    }
}

/// Resolve a cell color against the terminal's palette overrides.
pub(crate) fn resolve_color(color: &Color, colors: &Colors) -> Rgb {
    match color {
        Color::Spec(rgb) => Rgb::new(rgb.r, rgb.g, rgb.b),
        Color::Named(named) => match colors[*named] {
            Some(rgb) => Rgb::new(rgb.r, rgb.g, rgb.b),
            None => palette_rgb(*named as usize),
        },
        Color::Indexed(idx) => match colors[*idx as usize] {
            Some(rgb) => Rgb::new(rgb.r, rgb.g, rgb.b),
            None => palette_rgb(*idx as usize),
        },
    }
}

pub(crate) fn convert_cell(cell: &Cell, colors: &Colors) -> VtCell {
    const FLAG_MAP: [(AlacFlags, CellFlags); 7] = [
        (AlacFlags::BOLD, CellFlags::BOLD),
        (AlacFlags::ITALIC, CellFlags::ITALIC),
        (AlacFlags::UNDERLINE, CellFlags::UNDERLINE),
        (AlacFlags::STRIKEOUT, CellFlags::STRIKETHROUGH),
        (AlacFlags::INVERSE, CellFlags::INVERSE),
        (AlacFlags::DIM, CellFlags::DIM),
        (AlacFlags::HIDDEN, CellFlags::HIDDEN),
    ];

    let flags = FLAG_MAP
        .iter()
        .filter(|(alac, _)| cell.flags.contains(*alac))
        .fold(CellFlags::empty(), |acc, (_, ours)| acc | *ours);

    let width = if cell.flags.contains(AlacFlags::WIDE_CHAR) {
        2
    } else if cell.flags.contains(AlacFlags::WIDE_CHAR_SPACER) {
        0
    } else {
        1
    };

    VtCell {
        codepoint: cell.c,
        fg: resolve_color(&cell.fg, colors),
        bg: resolve_color(&cell.bg, colors),
        flags,
        width,
    }
}

pub(crate) fn convert_cursor_shape(shape: AlacCursorShape) -> CursorShape {
    match shape {
        AlacCursorShape::Block | AlacCursorShape::HollowBlock => CursorShape::Block,
        AlacCursorShape::Underline => CursorShape::Underline,
        AlacCursorShape::Beam => CursorShape::Bar,
        AlacCursorShape::Hidden => CursorShape::Hidden,
    }
}
