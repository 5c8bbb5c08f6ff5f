//! Alignment arithmetic.

/// Default placement alignment for transient allocations, in bytes.
pub const DEFAULT_ALIGN: u64 = 256;

/// Row pitch alignment for buffer footprints used in texture copies.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// Rounds `value` up to a multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Rounds `value` down to a multiple of `alignment`.
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    value & !(alignment - 1)
}

/// Returns true if `value` is a multiple of `alignment`.
#[inline]
pub fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(40 * 1024 + 1, 256), 40 * 1024 + 256);
    }

    #[test]
    fn test_align_down_and_check() {
        assert_eq!(align_down(511, 256), 256);
        assert!(is_aligned(512, 256));
        assert!(!is_aligned(513, 4));
    }
}
