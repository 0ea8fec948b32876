use std::fmt::{Display, Formatter};
use std::ops::Add;

/// A sequence number in the protocol's 16-bit wrapping sequence space.
///
/// There is no total order on sequence numbers: the space is a circle, and precedence is
///  only meaningful within a window smaller than half of it. `lt` and `leq` test that
///  windowed precedence - `a.lt(b)` iff `(b - a) mod 2^16` lies in `(0, 2^15)`.
///
/// All sequence comparisons in this crate go through these two methods. Comparing the raw
///  integers instead is a latent bug that only surfaces when a connection's sequence
///  numbers cross the wrap.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNumber(u16);

impl Display for SeqNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNumber {
    const HALF_SPACE: u16 = 0x8000;

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(1))
    }

    /// modular `<`
    pub fn lt(&self, other: SeqNumber) -> bool {
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < Self::HALF_SPACE
    }

    /// modular `<=`
    pub fn leq(&self, other: SeqNumber) -> bool {
        other.0.wrapping_sub(self.0) < Self::HALF_SPACE
    }
}

impl Add<u16> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::adjacent(1, 2, true)]
    #[case::same(5, 5, false)]
    #[case::reversed(2, 1, false)]
    #[case::window_edge(0, 0x7fff, true)]
    #[case::past_window_edge(0, 0x8000, false)]
    #[case::wrap_adjacent(0xffff, 0, true)]
    #[case::wrap_reversed(0, 0xffff, false)]
    #[case::wrap_window(0xfff0, 0x0010, true)]
    #[case::far_behind(0x8001, 0, true)]
    fn test_lt(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(SeqNumber::from_raw(a).lt(SeqNumber::from_raw(b)), expected);
    }

    #[rstest]
    #[case::adjacent(1, 2, true)]
    #[case::same(5, 5, true)]
    #[case::reversed(2, 1, false)]
    #[case::window_edge(0, 0x7fff, true)]
    #[case::past_window_edge(0, 0x8000, false)]
    #[case::wrap_adjacent(0xffff, 0, true)]
    #[case::wrap_reversed(0, 0xffff, false)]
    fn test_leq(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(SeqNumber::from_raw(a).leq(SeqNumber::from_raw(b)), expected);
    }

    #[rstest]
    #[case::regular(7, 8)]
    #[case::wrap(0xffff, 0)]
    fn test_next(#[case] value: u16, #[case] expected: u16) {
        assert_eq!(SeqNumber::from_raw(value).next(), SeqNumber::from_raw(expected));
    }

    #[rstest]
    #[case::regular(8, 7)]
    #[case::wrap(0, 0xffff)]
    fn test_prev(#[case] value: u16, #[case] expected: u16) {
        assert_eq!(SeqNumber::from_raw(value).prev(), SeqNumber::from_raw(expected));
    }

    #[rstest]
    #[case::regular(100, 20, 120)]
    #[case::wrap(0xfffe, 5, 3)]
    fn test_add(#[case] value: u16, #[case] rhs: u16, #[case] expected: u16) {
        assert_eq!(SeqNumber::from_raw(value) + rhs, SeqNumber::from_raw(expected));
    }
}
