//! Iterator helpers.

use std::iter::Zip;

/// Zips two iterators that are required to have the same length.
///
/// Unlike [`Iterator::zip`], which silently stops at the end of the shorter iterator, this panics
/// when the lengths differ. The per-level sequences of an SSD configuration are walked with it, so
/// a level can never be dropped or paired with data from another level.
#[track_caller]
pub fn zip_exact<A, B>(a: A, b: B) -> Zip<A::IntoIter, B::IntoIter>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let (a, b) = (a.into_iter(), b.into_iter());
    assert_eq!(
        a.len(),
        b.len(),
        "`zip_exact` called on iterators of length {} and {}",
        a.len(),
        b.len(),
    );

    a.zip(b)
}
