use std::{collections::HashSet, ops};

use crate::Flag;

/// Represents the set of maildir flags attached to one message.
///
/// Only membership matters, the order the flags were collected in
/// carries no meaning.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Flags(pub HashSet<Flag>);

impl Flags {
    /// Builds the flag letters sorted lexicographically, as they
    /// appear after the `2,` marker of a maildir filename.
    pub fn to_maildir_string(&self) -> String {
        let mut codes: Vec<char> = self.iter().map(Flag::to_char).collect();
        codes.sort_unstable();
        String::from_iter(codes)
    }
}

impl ops::Deref for Flags {
    type Target = HashSet<Flag>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ops::DerefMut for Flags {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<&str> for Flags {
    fn from(codes: &str) -> Self {
        codes.chars().collect()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<T: IntoIterator<Item = Flag>>(iter: T) -> Self {
        Flags(iter.into_iter().collect())
    }
}

impl FromIterator<char> for Flags {
    fn from_iter<T: IntoIterator<Item = char>>(iter: T) -> Self {
        iter.into_iter().map(Flag::from_char).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Flag, Flags};

    #[test]
    fn to_maildir_string_is_sorted() {
        let flags = Flags::from("TSRFD");
        assert_eq!("DFRST", flags.to_maildir_string());

        let flags = Flags::from_iter([Flag::Seen, Flag::Custom('a')]);
        assert_eq!("Sa", flags.to_maildir_string());

        assert_eq!("", Flags::default().to_maildir_string());
    }

    #[test]
    fn membership_ignores_order() {
        assert_eq!(Flags::from("RS"), Flags::from("SR"));
    }
}
