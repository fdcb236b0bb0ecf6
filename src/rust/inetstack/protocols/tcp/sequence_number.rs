// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// RFC 793, Section 3.3: the sequence number space ranges from 0 to 2^32 - 1 and wraps around, so arithmetic is modulo
// 2^32 and comparisons only hold between numbers less than 2^31 apart. Excluding equality, comparisons are not
// transitive, which is why sequence numbers get their own type instead of being plain integers.

use ::std::{
    cmp::Ordering,
    fmt,
    ops::{
        Add,
        Sub,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SeqNumber {
    value: u32,
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<SeqNumber> for u32 {
    #[inline]
    fn from(item: SeqNumber) -> u32 {
        item.value
    }
}

impl From<u32> for SeqNumber {
    #[inline]
    fn from(item: u32) -> Self {
        SeqNumber { value: item }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl Add for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: SeqNumber) -> SeqNumber {
        self.value.wrapping_add(other.value).into()
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: u32) -> SeqNumber {
        self.value.wrapping_add(other).into()
    }
}

impl Sub for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn sub(self, other: SeqNumber) -> SeqNumber {
        self.value.wrapping_sub(other.value).into()
    }
}

// There is no total order, so only the comparison operators are meaningful. partial_cmp answers by distance, which is
// consistent with them but must not be used to sort.
impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.value.wrapping_sub(other.value) as i32).partial_cmp(&0)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SeqNumber;
    use ::anyhow::Result;

    #[test]
    fn comparison() -> Result<()> {
        let s0: SeqNumber = SeqNumber::from(0);
        let s1: SeqNumber = SeqNumber::from(1);
        let s4: SeqNumber = SeqNumber::from(0x7fffffff);
        let s6: SeqNumber = SeqNumber::from(0x80000001);
        let s7: SeqNumber = SeqNumber::from(0xffffffff);

        crate::ensure_neq!(s0, s1);
        crate::ensure_eq!(s0 < s0, false);
        crate::ensure_eq!(s0 < s1, true);
        crate::ensure_eq!(s0 < s4, true);
        crate::ensure_eq!(s0 > s6, true);
        crate::ensure_eq!(s0 > s7, true);
        Ok(())
    }

    #[test]
    fn wrap_around() -> Result<()> {
        let big: SeqNumber = SeqNumber::from(0xffffffff);
        crate::ensure_eq!(big + 1, SeqNumber::from(0));
        crate::ensure_eq!(big < big + 1, true);
        crate::ensure_eq!(SeqNumber::from(2) - big, SeqNumber::from(3));
        Ok(())
    }
}
