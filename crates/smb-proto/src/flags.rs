//! Typed bit-flag sets
//!
//! Every flag field in the protocol (header flags, capabilities, security
//! mode, session flags) is carried as a [`FlagSet`] over an enum naming the
//! individual bits. Bits the enum does not name are retained so that a
//! decoded field re-encodes unchanged.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{BitOr, BitOrAssign};

/// One member of a flag family
pub trait Flag: Copy + Eq + fmt::Debug + 'static {
    /// Every named flag of the family
    const ALL: &'static [Self];

    /// Bit mask of this flag
    fn bits(self) -> u32;
}

/// Bitmask over a flag family `F`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagSet<F: Flag> {
    bits: u32,
    _family: PhantomData<F>,
}

impl<F: Flag> FlagSet<F> {
    /// Set with no flags
    pub const fn empty() -> Self {
        Self {
            bits: 0,
            _family: PhantomData,
        }
    }

    /// Build from a raw field value, keeping unnamed bits
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _family: PhantomData,
        }
    }

    /// Raw field value
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Check if no bit is set
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Check if flag is set
    pub fn contains(&self, flag: F) -> bool {
        self.bits & flag.bits() == flag.bits()
    }

    /// Set a flag
    pub fn insert(&mut self, flag: F) {
        self.bits |= flag.bits();
    }

    /// Clear a flag
    pub fn remove(&mut self, flag: F) {
        self.bits &= !flag.bits();
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, flag: F) -> Self {
        self.insert(flag);
        self
    }

    /// Bits common to both sets
    pub fn intersection(&self, other: Self) -> Self {
        Self::from_bits(self.bits & other.bits)
    }

    /// Named flags present in the set
    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        F::ALL.iter().copied().filter(move |f| self.contains(*f))
    }
}

impl<F: Flag> Default for FlagSet<F> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<F: Flag> From<F> for FlagSet<F> {
    fn from(flag: F) -> Self {
        Self::from_bits(flag.bits())
    }
}

impl<F: Flag> FromIterator<F> for FlagSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut set = Self::empty();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

impl<F: Flag> BitOr<F> for FlagSet<F> {
    type Output = Self;

    fn bitor(self, rhs: F) -> Self {
        self.with(rhs)
    }
}

impl<F: Flag> BitOr for FlagSet<F> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.bits | rhs.bits)
    }
}

impl<F: Flag> BitOrAssign<F> for FlagSet<F> {
    fn bitor_assign(&mut self, rhs: F) {
        self.insert(rhs);
    }
}

impl<F: Flag> fmt::Debug for FlagSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named: u32 = F::ALL.iter().fold(0, |acc, flag| acc | flag.bits());
        let mut list = f.debug_set();
        list.entries(self.iter());
        let unknown = self.bits & !named;
        if unknown != 0 {
            list.entry(&format_args!("0x{unknown:X}"));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Color {
        Red,
        Blue,
    }

    impl Flag for Color {
        const ALL: &'static [Self] = &[Self::Red, Self::Blue];

        fn bits(self) -> u32 {
            match self {
                Self::Red => 0x1,
                Self::Blue => 0x4,
            }
        }
    }

    #[test]
    fn test_insert_remove() {
        let mut set = FlagSet::<Color>::empty();
        assert!(set.is_empty());
        set.insert(Color::Blue);
        assert!(set.contains(Color::Blue));
        assert!(!set.contains(Color::Red));
        set.remove(Color::Blue);
        assert!(set.is_empty());
    }

    #[test]
    fn test_unknown_bits_kept() {
        let set = FlagSet::<Color>::from_bits(0x81);
        assert!(set.contains(Color::Red));
        assert_eq!(set.bits(), 0x81);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Color::Red]);
        assert_eq!(format!("{set:?}"), "{Red, 0x80}");
    }

    #[test]
    fn test_collect_and_or() {
        let set: FlagSet<Color> = [Color::Red, Color::Blue].into_iter().collect();
        assert_eq!(set.bits(), 0x5);
        assert_eq!((FlagSet::from(Color::Red) | Color::Blue), set);
        assert_eq!(set.intersection(Color::Blue.into()).bits(), 0x4);
    }
}
