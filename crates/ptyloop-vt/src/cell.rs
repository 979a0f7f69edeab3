use bitflags::bitflags;

/// RGB color value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Foreground used when neither the palette nor the cell names a color.
pub const DEFAULT_FG: Rgb = Rgb::new(229, 229, 229);

/// Background used when neither the palette nor the cell names a color.
pub const DEFAULT_BG: Rgb = Rgb::new(0, 0, 0);

bitflags! {
    /// Cell attribute flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CellFlags: u8 {
        const BOLD          = 0b0000_0001;
        const ITALIC        = 0b0000_0010;
        const UNDERLINE     = 0b0000_0100;
        const STRIKETHROUGH = 0b0000_1000;
        const INVERSE       = 0b0001_0000;
        const DIM           = 0b0010_0000;
        const HIDDEN        = 0b0100_0000;
    }
}

/// A single cell of the terminal grid, detached from the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VtCell {
    /// The character displayed in this cell.
    pub codepoint: char,
    pub fg: Rgb,
    pub bg: Rgb,
    pub flags: CellFlags,
    /// 1 for normal cells, 2 for the leading half of a wide character and 0
    /// for the spacer that follows it.
    pub width: u8,
}

impl VtCell {
    /// True for the trailing half of a wide character.
    pub fn is_spacer(&self) -> bool {
        self.width == 0
    }

    /// True when the cell shows nothing but a default-styled space.
    pub fn is_blank(&self) -> bool {
        self.codepoint == ' ' && self.flags.is_empty() && self.bg == DEFAULT_BG
    }
}

impl Default for VtCell {
    fn default() -> Self {
        Self {
            codepoint: ' ',
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
            flags: CellFlags::empty(),
            width: 1,
        }
    }
}
