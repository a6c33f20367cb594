//! Order-preserving integer encoding for composed index keys.

/// Encode `n` as fixed-width lowercase hex.
///
/// The byte order of two encodings matches the numeric order of the values,
/// which is what makes range bounds over `(context, seq)` index keys work.
pub fn lexint_hex(n: u64) -> String {
    format!("{n:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_fixed_width() {
        assert_eq!(lexint_hex(0).len(), 16);
        assert_eq!(lexint_hex(u64::MAX).len(), 16);
        assert_eq!(lexint_hex(0), "0000000000000000");
        assert_eq!(lexint_hex(255), "00000000000000ff");
    }

    #[test]
    fn string_order_matches_integer_order() {
        let samples = [
            0u64,
            1,
            9,
            10,
            15,
            16,
            255,
            256,
            4095,
            4096,
            65535,
            65536,
            1 << 32,
            u64::MAX - 1,
            u64::MAX,
        ];
        for window in samples.windows(2) {
            let (a, b) = (window[0], window[1]);
            assert!(
                lexint_hex(a) < lexint_hex(b),
                "{a} must encode below {b}"
            );
        }
    }
}
