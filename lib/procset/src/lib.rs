//! An ordered set of processor IDs stored as a disjoint union of closed
//! intervals.
//!
//! Processor sets show up everywhere in cluster bookkeeping: a host's free
//! cores per socket, the cores a job holds, the cluster-wide free pool. The
//! interval representation keeps the common operations (union, difference,
//! intersection) linear in the number of intervals rather than the number of
//! processors, and gives canonical string forms like `"0-3 8-11"` for free.
//!
//! Invariants maintained by every constructor and operation: intervals are
//! non-empty, pairwise disjoint, strictly increasing, and non-adjacent
//! (adjacent intervals are coalesced).

use std::fmt;
use std::str::FromStr;

/// A closed interval of processor IDs, `lo..=hi`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interval {
    pub lo: u32,
    pub hi: u32,
}

impl Interval {
    /// Number of processor IDs in the interval.
    pub fn count(&self) -> u32 {
        self.hi - self.lo + 1
    }
}

/// A set of processor IDs as a sorted list of disjoint closed intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcSet {
    // sorted, disjoint, non-adjacent
    intervals: Vec<(u32, u32)>,
}

impl ProcSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The contiguous set `lo..=hi`.
    pub fn from_range(lo: u32, hi: u32) -> Self {
        assert!(lo <= hi);
        Self {
            intervals: vec![(lo, hi)],
        }
    }

    /// Number of processor IDs in the set.
    pub fn len(&self) -> u32 {
        self.intervals.iter().map(|&(lo, hi)| hi - lo + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        // intervals are sorted, so a binary search on the lower bound works
        match self.intervals.binary_search_by_key(&id, |&(lo, _)| lo) {
            Ok(_) => true,
            Err(0) => false,
            Err(i) => self.intervals[i - 1].1 >= id,
        }
    }

    /// The smallest ID in the set.
    pub fn min(&self) -> Option<u32> {
        self.intervals.first().map(|&(lo, _)| lo)
    }

    /// The largest ID in the set.
    pub fn max(&self) -> Option<u32> {
        self.intervals.last().map(|&(_, hi)| hi)
    }

    /// Iterate over the disjoint intervals in increasing order.
    pub fn intervals(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals.iter().map(|&(lo, hi)| Interval { lo, hi })
    }

    /// Iterate over the processor IDs in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.intervals.iter().flat_map(|&(lo, hi)| lo..=hi)
    }

    /// The first `n` processor IDs of the set (all of them if `n` exceeds the
    /// cardinality).
    pub fn take(&self, n: u32) -> ProcSet {
        let mut out = Vec::new();
        let mut left = n;
        for &(lo, hi) in &self.intervals {
            if left == 0 {
                break;
            }
            let count = hi - lo + 1;
            if count <= left {
                out.push((lo, hi));
                left -= count;
            } else {
                out.push((lo, lo + left - 1));
                left = 0;
            }
        }
        ProcSet { intervals: out }
    }

    /// Set union, `O(n + m)` in interval counts.
    pub fn union(&self, other: &ProcSet) -> ProcSet {
        let mut out: Vec<(u32, u32)> = Vec::with_capacity(self.intervals.len() + other.intervals.len());
        let mut a = self.intervals.iter().peekable();
        let mut b = other.intervals.iter().peekable();

        let mut push = |iv: (u32, u32), out: &mut Vec<(u32, u32)>| {
            match out.last_mut() {
                // coalesce overlapping or adjacent intervals
                Some(last) if iv.0 <= last.1.saturating_add(1) => last.1 = last.1.max(iv.1),
                _ => out.push(iv),
            }
        };

        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) => {
                    if x.0 <= y.0 {
                        a.next();
                        x
                    } else {
                        b.next();
                        y
                    }
                }
                (Some(&&x), None) => {
                    a.next();
                    x
                }
                (None, Some(&&y)) => {
                    b.next();
                    y
                }
                (None, None) => break,
            };
            push(next, &mut out);
        }

        ProcSet { intervals: out }
    }

    /// Set difference, `O(n + m)` in interval counts.
    pub fn difference(&self, other: &ProcSet) -> ProcSet {
        let mut out = Vec::with_capacity(self.intervals.len());
        let mut b = other.intervals.iter().peekable();

        for &(lo, hi) in &self.intervals {
            let mut lo = lo;
            loop {
                // drop subtrahend intervals entirely below the uncovered part
                while let Some(&&(_, bhi)) = b.peek() {
                    if bhi < lo {
                        b.next();
                    } else {
                        break;
                    }
                }

                match b.peek() {
                    Some(&&(blo, bhi)) if blo <= hi => {
                        if lo < blo {
                            out.push((lo, blo - 1));
                        }
                        if bhi >= hi {
                            // the rest of [lo, hi] is covered; the subtrahend
                            // interval may still overlap the next one, keep it
                            break;
                        }
                        lo = bhi + 1;
                        b.next();
                    }
                    _ => {
                        out.push((lo, hi));
                        break;
                    }
                }
            }
        }

        ProcSet { intervals: out }
    }

    /// Set intersection, `O(n + m)` in interval counts.
    pub fn intersection(&self, other: &ProcSet) -> ProcSet {
        let mut out = Vec::new();
        let mut i = 0;
        let mut j = 0;

        while i < self.intervals.len() && j < other.intervals.len() {
            let (alo, ahi) = self.intervals[i];
            let (blo, bhi) = other.intervals[j];

            let lo = alo.max(blo);
            let hi = ahi.min(bhi);
            if lo <= hi {
                out.push((lo, hi));
            }

            // advance the interval that ends first
            if ahi <= bhi {
                i += 1;
            } else {
                j += 1;
            }
        }

        ProcSet { intervals: out }
    }

    /// Whether `other` is a subset of `self`.
    pub fn is_superset(&self, other: &ProcSet) -> bool {
        other.difference(self).is_empty()
    }
}

impl FromIterator<u32> for ProcSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut ids: Vec<u32> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut intervals: Vec<(u32, u32)> = Vec::new();
        for id in ids {
            match intervals.last_mut() {
                Some(last) if id == last.1 + 1 => last.1 = id,
                _ => intervals.push((id, id)),
            }
        }
        ProcSet { intervals }
    }
}

impl<'a> IntoIterator for &'a ProcSet {
    type Item = u32;
    type IntoIter = Box<dyn Iterator<Item = u32> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $func:ident) => {
        impl std::ops::$trait for &ProcSet {
            type Output = ProcSet;
            fn $method(self, rhs: &ProcSet) -> ProcSet {
                self.$func(rhs)
            }
        }

        impl std::ops::$trait for ProcSet {
            type Output = ProcSet;
            fn $method(self, rhs: ProcSet) -> ProcSet {
                self.$func(&rhs)
            }
        }

        impl std::ops::$assign_trait<&ProcSet> for ProcSet {
            fn $assign_method(&mut self, rhs: &ProcSet) {
                *self = self.$func(rhs);
            }
        }
    };
}

impl_binop!(BitOr, bitor, BitOrAssign, bitor_assign, union);
impl_binop!(Sub, sub, SubAssign, sub_assign, difference);
impl_binop!(BitAnd, bitand, BitAndAssign, bitand_assign, intersection);

/// Canonical form: intervals in increasing order separated by single spaces,
/// each written `lo-hi`, or bare `lo` when the interval is a single ID.
impl fmt::Display for ProcSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(lo, hi)) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        Ok(())
    }
}

/// Error parsing a processor-set string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseProcSetError(String);

impl fmt::Display for ParseProcSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid processor set: {}", self.0)
    }
}

impl std::error::Error for ParseProcSetError {}

/// Parses whitespace-separated items, each either `a` or `a-b`. Items need
/// not be sorted or disjoint; the result is canonicalized.
impl FromStr for ProcSet {
    type Err = ParseProcSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = ProcSet::new();
        for item in s.split_whitespace() {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (
                    lo.parse().map_err(|_| ParseProcSetError(item.into()))?,
                    hi.parse().map_err(|_| ParseProcSetError(item.into()))?,
                ),
                None => {
                    let id = item.parse().map_err(|_| ParseProcSetError(item.into()))?;
                    (id, id)
                }
            };
            if lo > hi {
                return Err(ParseProcSetError(item.into()));
            }
            set |= &ProcSet::from_range(lo, hi);
        }
        Ok(set)
    }
}

/// Serialized as the canonical display string, so sets embedded in traces and
/// databases stay human-readable and round-trip exactly.
impl serde::Serialize for ProcSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ProcSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> ProcSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_from_str_canonicalizes() {
        assert_eq!(set("").to_string(), "");
        assert_eq!(set("3").to_string(), "3");
        assert_eq!(set("0-3").to_string(), "0-3");
        assert_eq!(set("3 1 2 0").to_string(), "0-3");
        assert_eq!(set("0-1 2-3").to_string(), "0-3");
        assert_eq!(set("4-7 0-3 9").to_string(), "0-7 9");
        assert_eq!(set("5 5 5").to_string(), "5");
    }

    #[test]
    fn test_from_str_rejects_garbage() {
        assert!("x".parse::<ProcSet>().is_err());
        assert!("3-1".parse::<ProcSet>().is_err());
        assert!("1-2-3".parse::<ProcSet>().is_err());
    }

    #[test]
    fn test_len_and_contains() {
        let s = set("0-3 8-11");
        assert_eq!(s.len(), 8);
        assert!(s.contains(0));
        assert!(s.contains(3));
        assert!(!s.contains(4));
        assert!(s.contains(8));
        assert!(!s.contains(12));
        assert!(!ProcSet::new().contains(0));
    }

    #[test]
    fn test_union() {
        assert_eq!(set("0-3") | set("8-11"), set("0-3 8-11"));
        assert_eq!(set("0-3") | set("4-7"), set("0-7"));
        assert_eq!(set("0-5") | set("3-8"), set("0-8"));
        assert_eq!(set("0 2 4") | set("1 3"), set("0-4"));
        assert_eq!(set("") | set("1-2"), set("1-2"));
    }

    #[test]
    fn test_difference() {
        assert_eq!(set("0-7") - set("4-7"), set("0-3"));
        assert_eq!(set("0-7") - set("2-5"), set("0-1 6-7"));
        assert_eq!(set("0-7") - set("0-7"), set(""));
        assert_eq!(set("0-3 8-11") - set("2-9"), set("0-1 10-11"));
        assert_eq!(set("0-3") - set("10-20"), set("0-3"));
        assert_eq!(set("0 2 4 6") - set("2 6"), set("0 4"));
    }

    #[test]
    fn test_intersection() {
        assert_eq!(set("0-7") & set("4-11"), set("4-7"));
        assert_eq!(set("0-3 8-11") & set("2-9"), set("2-3 8-9"));
        assert_eq!(set("0-3") & set("8-11"), set(""));
        assert_eq!(set("0-11") & set("1 3 5"), set("1 3 5"));
    }

    #[test]
    fn test_take() {
        let s = set("0-3 8-11");
        assert_eq!(s.take(0), set(""));
        assert_eq!(s.take(2), set("0-1"));
        assert_eq!(s.take(4), set("0-3"));
        assert_eq!(s.take(6), set("0-3 8-9"));
        assert_eq!(s.take(100), s);
    }

    #[test]
    fn test_intervals_and_iter() {
        let s = set("0-2 5");
        let ivs: Vec<_> = s.intervals().collect();
        assert_eq!(ivs, vec![Interval { lo: 0, hi: 2 }, Interval { lo: 5, hi: 5 }]);
        assert_eq!(ivs[0].count(), 3);
        let ids: Vec<_> = s.iter().collect();
        assert_eq!(ids, vec![0, 1, 2, 5]);
    }

    #[test]
    fn test_superset() {
        assert!(set("0-7").is_superset(&set("2-3 6")));
        assert!(!set("0-7").is_superset(&set("7-8")));
        assert!(set("0-7").is_superset(&set("")));
    }

    #[test]
    fn test_from_iter() {
        let s: ProcSet = [4u32, 1, 2, 9, 3].into_iter().collect();
        assert_eq!(s, set("1-4 9"));
    }
}
