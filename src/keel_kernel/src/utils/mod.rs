//! Utility
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because it's needed by port implementations.
use core::marker::PhantomData;

pub(crate) mod binary_heap;

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [T::INIT; LEN];
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

macro_rules! impl_init {
    ( $( $ty:ty => $value:expr, )* ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    i32 => 0,
    isize => 0,
    () => (),
}

/// A fixed-capacity bit set tracking which priority bands currently hold at
/// least one ready task. Bit `i` corresponds to priority `i`.
///
/// The capacity is limited to `usize::BITS` bits, which is enough for the
/// priority range supported by this kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PrioBitmap(usize);

impl Init for PrioBitmap {
    const INIT: Self = Self(0);
}

impl PrioBitmap {
    pub(crate) fn get(&self, i: usize) -> bool {
        debug_assert!(i < usize::BITS as usize);
        self.0 & (1 << i) != 0
    }

    pub(crate) fn set(&mut self, i: usize) {
        debug_assert!(i < usize::BITS as usize);
        self.0 |= 1 << i;
    }

    pub(crate) fn clear(&mut self, i: usize) {
        debug_assert!(i < usize::BITS as usize);
        self.0 &= !(1 << i);
    }

    /// Return the position of the least significant set bit, i.e., the
    /// highest priority band that holds a ready task.
    pub(crate) fn find_set(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prio_bitmap_set_clear() {
        let mut m = PrioBitmap::INIT;
        assert_eq!(m.find_set(), None);

        m.set(5);
        m.set(14);
        assert!(m.get(5));
        assert!(m.get(14));
        assert!(!m.get(6));
        assert_eq!(m.find_set(), Some(5));

        m.clear(5);
        assert!(!m.get(5));
        assert_eq!(m.find_set(), Some(14));

        m.clear(14);
        assert_eq!(m.find_set(), None);
    }

    #[quickcheck_macros::quickcheck]
    fn prio_bitmap_finds_minimum(mut bits: std::vec::Vec<u8>) -> bool {
        bits.retain(|&b| (b as usize) < usize::BITS as usize);

        let mut m = PrioBitmap::INIT;
        for &b in bits.iter() {
            m.set(b as usize);
        }

        m.find_set() == bits.iter().copied().min().map(|b| b as usize)
    }
}
