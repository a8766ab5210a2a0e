/// Represents the maildir flag variants.
///
/// The standard flags use the upper-case letters `D F R S T`,
/// lower-case letters are reserved for custom flags.
#[derive(Debug, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Flag {
    Draft,
    Flagged,
    Replied,
    Seen,
    Trashed,
    Custom(char),
}

impl Flag {
    /// Parses a flag from its single-letter maildir code.
    pub fn from_char(c: char) -> Self {
        match c {
            'D' => Flag::Draft,
            'F' => Flag::Flagged,
            'R' => Flag::Replied,
            'S' => Flag::Seen,
            'T' => Flag::Trashed,
            c => Flag::Custom(c),
        }
    }

    /// Returns the single-letter maildir code of the flag.
    pub fn to_char(&self) -> char {
        match self {
            Flag::Draft => 'D',
            Flag::Flagged => 'F',
            Flag::Replied => 'R',
            Flag::Seen => 'S',
            Flag::Trashed => 'T',
            Flag::Custom(c) => *c,
        }
    }
}

impl From<char> for Flag {
    fn from(c: char) -> Self {
        Self::from_char(c)
    }
}
