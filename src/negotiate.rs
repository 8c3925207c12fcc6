//! Format negotiator: intersects capability sets across endpoints and
//! filters, deterministically.

use crate::error::{Error, FormatMismatch};
use crate::format::CapabilitySet;

/// Intersects `filters` (in order), then `output`, then `input`, and picks
/// the most preferred surviving format.
///
/// The running accumulator starts as the first filter's set (or `output`'s,
/// if there are no filters) and is narrowed by each subsequent set in turn;
/// since `CapabilitySet::intersect` preserves the accumulator's relative
/// order, the final `preferred()` pick is exactly "the first candidate of
/// the first filter's preferred order" (or the output's, with no filter),
/// as required. The result does not depend on iteration order beyond that:
/// reordering the filter list after the first entry yields the same
/// surviving set, only a possibly different tie-break winner, which matches
/// the documented (non-)commutativity.
///
/// This function has no side effects; it is the caller's responsibility to
/// commit the result by writing it to both ports' `format`.
pub fn negotiate(
    output: &CapabilitySet,
    input: &CapabilitySet,
    filters: &[CapabilitySet],
) -> Result<crate::format::Format, Error> {
    let mut chain = filters.iter().chain(std::iter::once(output)).chain(std::iter::once(input));

    let mut acc = chain.next().expect("chain always has output and input").clone();
    for next in chain {
        let narrowed = acc.intersect(next);
        if narrowed.is_empty() {
            return Err(Error::IncompatibleFormats(FormatMismatch {
                left: format_bytes(&acc),
                right: format_bytes(next),
            }));
        }
        acc = narrowed;
    }

    acc.preferred().cloned().ok_or_else(|| {
        Error::IncompatibleFormats(FormatMismatch { left: format_bytes(output), right: format_bytes(input) })
    })
}

fn format_bytes(set: &CapabilitySet) -> Vec<u8> {
    set.formats().iter().flat_map(|f| f.as_bytes().to_vec()).collect()
}
