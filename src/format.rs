//! The opaque format/capability-set abstraction consumed by the negotiator
//! The concrete representation of a format is deliberately left as an
//! opaque byte blob so the core stays reusable across media domains; media
//! modules build richer types on top and serialize them into `Format`.

/// A single concrete, opaque format choice.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Format(Vec<u8>);

impl Format {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for Format {
    fn from(s: &str) -> Self {
        Format::new(s.as_bytes().to_vec())
    }
}

/// A capability set: the (possibly infinite in principle, finite in this
/// implementation) set of formats an endpoint is willing to speak.
///
/// Order matters: it is the endpoint's *preferred* order, most preferred
/// first. `intersect` preserves `self`'s relative order among the formats
/// that survive, which is what lets the negotiator's tie-break rule ("first
/// candidate of the first filter's preferred order") fall out of plain
/// repeated intersection rather than needing separate bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapabilitySet(Vec<Format>);

impl CapabilitySet {
    pub fn new(formats: impl IntoIterator<Item = Format>) -> Self {
        Self(formats.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, format: &Format) -> bool {
        self.0.contains(format)
    }

    pub fn formats(&self) -> &[Format] {
        &self.0
    }

    /// The intersection of `self` and `other`, in `self`'s order.
    pub fn intersect(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.iter().filter(|f| other.contains(f)).cloned().collect())
    }

    /// The most preferred format in this set, if any.
    pub fn preferred(&self) -> Option<&Format> {
        self.0.first()
    }
}

impl FromIterator<Format> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Format>>(iter: T) -> Self {
        CapabilitySet::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(strs: &[&str]) -> CapabilitySet {
        CapabilitySet::new(strs.iter().map(|s| Format::from(*s)))
    }

    #[test]
    fn intersect_preserves_self_order() {
        let a = set(&["a", "b", "c"]);
        let b = set(&["c", "a"]);
        let i = a.intersect(&b);
        assert_eq!(i.formats(), &[Format::from("a"), Format::from("c")]);
    }

    #[test]
    fn intersect_with_disjoint_is_empty() {
        let a = set(&["a"]);
        let b = set(&["b"]);
        assert!(a.intersect(&b).is_empty());
    }
}
