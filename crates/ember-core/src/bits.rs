//! Bit-scan helpers used by dirty-mask bookkeeping.
//!
//! All scans return `None` for a zero mask.

/// Index of the lowest set bit.
#[inline]
pub fn bit_scan_forward(mask: u32) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros())
    }
}

/// Index of the highest set bit.
#[inline]
pub fn bit_scan_reverse(mask: u32) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(31 - mask.leading_zeros())
    }
}

/// Index of the lowest set bit of a 64-bit mask.
#[inline]
pub fn bit_scan_forward64(mask: u64) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros())
    }
}

/// Index of the highest set bit of a 64-bit mask.
#[inline]
pub fn bit_scan_reverse64(mask: u64) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(63 - mask.leading_zeros())
    }
}

/// Iterator over the indices of set bits, lowest first.
#[derive(Debug, Clone, Copy)]
pub struct SetBits(u32);

impl SetBits {
    pub fn new(mask: u32) -> Self {
        Self(mask)
    }
}

impl Iterator for SetBits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let index = bit_scan_forward(self.0)?;
        self.0 ^= 1 << index;
        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_mask_has_no_bits() {
        assert_eq!(bit_scan_forward(0), None);
        assert_eq!(bit_scan_reverse(0), None);
        assert_eq!(bit_scan_forward64(0), None);
        assert_eq!(bit_scan_reverse64(0), None);
    }

    #[test]
    fn test_scans_find_extreme_bits() {
        assert_eq!(bit_scan_forward(0b1011_0000), Some(4));
        assert_eq!(bit_scan_reverse(0b1011_0000), Some(7));
        assert_eq!(bit_scan_forward(1 << 31), Some(31));
        assert_eq!(bit_scan_reverse(1), Some(0));
        assert_eq!(bit_scan_forward64(1 << 40 | 1 << 63), Some(40));
        assert_eq!(bit_scan_reverse64(1 << 40 | 1 << 63), Some(63));
    }

    #[test]
    fn test_set_bits_iterates_low_to_high() {
        let bits: Vec<u32> = SetBits::new(0b1000_0101).collect();
        assert_eq!(bits, vec![0, 2, 7]);
        assert_eq!(SetBits::new(0).count(), 0);
    }
}
