use bitflags::bitflags;

bitflags! {
    /// Permission bits of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegionFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl RegionFlags {
    pub fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_executable(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

/// Tri-state permission requirement.
///
/// Each axis is independently required on (`Some(true)`), required off
/// (`Some(false)`) or irrelevant (`None`). The three-glyph string form uses
/// `r`/`w`/`x` for "required on", `-` for "required off" and any other glyph
/// for "don't care"; the convention is an asterisk.
///
/// ```
/// use memchain::FlagSpecification;
///
/// let readonly = FlagSpecification::new("r--");
/// let code = FlagSpecification::new("r*x");
/// # let _ = (readonly, code);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSpecification {
    pub(crate) readable: Option<bool>,
    pub(crate) writable: Option<bool>,
    pub(crate) executable: Option<bool>,
}

impl FlagSpecification {
    /// Matches every permission combination.
    pub const ANY: Self = Self {
        readable: None,
        writable: None,
        executable: None,
    };

    pub fn new(spec: &str) -> Self {
        let mut glyphs = spec.chars();
        Self {
            readable: Self::parse_axis('r', glyphs.next()),
            writable: Self::parse_axis('w', glyphs.next()),
            executable: Self::parse_axis('x', glyphs.next()),
        }
    }

    fn parse_axis(on: char, glyph: Option<char>) -> Option<bool> {
        match glyph {
            Some('-') => Some(false),
            Some(c) if c == on => Some(true),
            _ => None,
        }
    }

    fn axis_allows(requirement: Option<bool>, state: bool) -> bool {
        requirement.is_none() || requirement == Some(state)
    }

    pub fn allows(&self, flags: RegionFlags) -> bool {
        Self::axis_allows(self.readable, flags.is_readable())
            && Self::axis_allows(self.writable, flags.is_writable())
            && Self::axis_allows(self.executable, flags.is_executable())
    }
}

impl From<&str> for FlagSpecification {
    fn from(spec: &str) -> Self {
        Self::new(spec)
    }
}
