//! Constant-time comparison of secret contents.
//!
//! Used to decide whether a rotated file actually changed without leaking,
//! through comparison timing, where two equal-length values first differ.
//! The length of the inputs is not protected: slices of different length
//! compare unequal immediately.

use subtle::ConstantTimeEq;

/// Returns `true` iff `a` and `b` hold the same bytes.
///
/// Equal-length inputs are compared across their full length with no early
/// exit. Only byte slices are accepted; anything else is rejected at compile
/// time.
#[must_use]
pub fn equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}
