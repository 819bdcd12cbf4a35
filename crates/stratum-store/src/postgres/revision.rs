//! Revisions as `(xid, snapshot)` pairs.
//!
//! PostgreSQL allocates a 64-bit transaction id (`xid8`) for every write
//! transaction and can report the set of concurrently-visible transactions as
//! a `pg_snapshot`. A revision captures both, which lets a reader evaluate
//! "was this row's creating/deleting transaction committed as of this
//! revision?" entirely from the snapshot, without consulting commit state.
//!
//! The textual snapshot format mirrors PostgreSQL's: `xmin:xmax:xip1,xip2`.
//! Every xid strictly below `xmin` is visible; every xid at or above `xmax`
//! is not; xids in between are visible unless listed in `xip_list`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stratum_types::{StoreError, StoreResult};

/// The xid8 value a live row carries in `deleted_xid`: the largest positive
/// signed 64-bit integer.
pub const LIVE_DELETED_XID: u64 = 9_223_372_036_854_775_807;

/// The backend tag prefixing full-form revision tokens.
const TOKEN_PREFIX: &str = "pg:";

/// A PostgreSQL 64-bit transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xid(pub u64);

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Xid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Xid)
    }
}

/// How two snapshots relate to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRelation {
    Equal,
    /// `self` sees a strict subset of the other snapshot's transactions.
    Before,
    /// `self` sees a strict superset of the other snapshot's transactions.
    After,
    /// Each snapshot sees transactions the other does not.
    Concurrent,
}

/// The set of transactions visible at a point in time, in PostgreSQL's
/// `xmin:xmax:xip_list` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSnapshot {
    xmin: u64,
    xmax: u64,
    /// In-progress xids within `[xmin, xmax)`, sorted ascending.
    xip_list: Vec<u64>,
}

impl PgSnapshot {
    pub fn new(xmin: u64, xmax: u64, mut xip_list: Vec<u64>) -> Self {
        xip_list.sort_unstable();
        xip_list.dedup();
        Self { xmin, xmax, xip_list }
    }

    /// The snapshot in which exactly the transactions `<= xid` are visible.
    pub fn complete_through(xid: u64) -> Self {
        let next = xid.saturating_add(1);
        Self { xmin: next, xmax: next, xip_list: Vec::new() }
    }

    pub fn xmin(&self) -> u64 {
        self.xmin
    }

    pub fn xmax(&self) -> u64 {
        self.xmax
    }

    /// Whether the given transaction is committed and visible here.
    pub fn visible(&self, xid: Xid) -> bool {
        let xid = xid.0;
        if xid < self.xmin {
            return true;
        }
        if xid >= self.xmax {
            return false;
        }
        self.xip_list.binary_search(&xid).is_err()
    }

    /// A copy of this snapshot in which `xid` is visible.
    pub fn mark_complete(&self, xid: Xid) -> Self {
        let xid = xid.0;
        let mut result = self.clone();

        if xid >= result.xmax {
            // Everything between the old horizon and the new xid remains
            // in-progress.
            result.xip_list.extend(result.xmax..xid);
            result.xmax = xid.saturating_add(1);
        }
        if let Ok(pos) = result.xip_list.binary_search(&xid) {
            result.xip_list.remove(pos);
        }
        result
    }

    /// A copy of this snapshot in which `xid` is not visible.
    pub fn mark_in_progress(&self, xid: Xid) -> Self {
        let xid = xid.0;
        let mut result = self.clone();

        if xid >= result.xmax {
            return result;
        }
        if xid < result.xmin {
            result.xmin = xid;
        }
        if let Err(pos) = result.xip_list.binary_search(&xid) {
            result.xip_list.insert(pos, xid);
        }
        result
    }

    /// True when every transaction visible in `other` is visible here.
    fn covers(&self, other: &PgSnapshot) -> bool {
        // Any xid we consider in-progress but the other considers committed
        // breaks coverage.
        for &xip in &self.xip_list {
            if xip < other.xmax && other.xip_list.binary_search(&xip).is_err() {
                return false;
            }
        }
        // Any xid beyond our horizon that the other has committed breaks
        // coverage, unless the other also lists it as in progress.
        if other.xmax > self.xmax {
            let lo = other.xip_list.partition_point(|&x| x < self.xmax);
            let hi = other.xip_list.partition_point(|&x| x < other.xmax);
            let in_progress = (hi - lo) as u64;
            if other.xmax - self.xmax != in_progress {
                return false;
            }
        }
        true
    }

    pub fn relation_to(&self, other: &PgSnapshot) -> SnapshotRelation {
        match (self.covers(other), other.covers(self)) {
            (true, true) => SnapshotRelation::Equal,
            (true, false) => SnapshotRelation::After,
            (false, true) => SnapshotRelation::Before,
            (false, false) => SnapshotRelation::Concurrent,
        }
    }
}

impl fmt::Display for PgSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.xmin, self.xmax)?;
        for (i, xip) in self.xip_list.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{xip}")?;
        }
        Ok(())
    }
}

impl FromStr for PgSnapshot {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StoreError::InvalidRevision {
            token: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.splitn(3, ':');
        let xmin = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| invalid("missing or malformed xmin"))?;
        let xmax = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| invalid("missing or malformed xmax"))?;
        if xmin > xmax {
            return Err(invalid("xmin exceeds xmax"));
        }
        let xip_list = match parts.next() {
            None | Some("") => Vec::new(),
            Some(rest) => rest
                .split(',')
                .map(|p| p.parse::<u64>().map_err(|_| invalid("malformed xip entry")))
                .collect::<Result<Vec<_>, _>>()?,
        };
        for &xip in &xip_list {
            if xip < xmin || xip >= xmax {
                return Err(invalid("xip entry outside [xmin, xmax)"));
            }
        }
        Ok(PgSnapshot::new(xmin, xmax, xip_list))
    }
}

/// A revision: the transaction id a caller pins reads to, together with the
/// snapshot describing what that transaction could see (plus itself, once
/// committed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    xid: Xid,
    snapshot: PgSnapshot,
}

impl Revision {
    pub fn new(xid: Xid, snapshot: PgSnapshot) -> Self {
        Self { xid, snapshot }
    }

    /// The committed revision for a write transaction: its snapshot with its
    /// own xid marked visible.
    pub fn for_committed(xid: Xid, snapshot: PgSnapshot) -> Self {
        Self { xid, snapshot: snapshot.mark_complete(xid) }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn snapshot(&self) -> &PgSnapshot {
        &self.snapshot
    }

    /// Spec ordering: `self` is at-or-after `other` iff `other`'s xid is
    /// visible in `self`'s snapshot.
    pub fn at_or_after(&self, other: &Revision) -> bool {
        self.snapshot.visible(other.xid)
    }

    /// Two revisions are equivalent when their snapshots agree on every
    /// transaction up to the larger xid.
    pub fn equivalent(&self, other: &Revision) -> bool {
        self.snapshot.relation_to(&other.snapshot) == SnapshotRelation::Equal
    }

    pub fn greater_than(&self, other: &Revision) -> bool {
        self.at_or_after(other) && !self.equivalent(other)
    }

    /// Parses a revision token. The accepted formats are closed:
    /// `pg:<xid>@<snapshot>` and the legacy bare-decimal xid form.
    pub fn parse_token(token: &str) -> StoreResult<Revision> {
        let invalid = |reason: &str| StoreError::InvalidRevision {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = token.strip_prefix(TOKEN_PREFIX) {
            let (xid_str, snapshot_str) =
                rest.split_once('@').ok_or_else(|| invalid("missing snapshot separator"))?;
            let xid: Xid = xid_str.parse().map_err(|_| invalid("malformed xid"))?;
            let snapshot: PgSnapshot = snapshot_str.parse().map_err(|err| match err {
                StoreError::InvalidRevision { reason, .. } => invalid(&reason),
                other => other,
            })?;
            return Ok(Revision::new(xid, snapshot));
        }

        // Legacy form: a bare xid, implying everything through it is visible.
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            let xid: Xid = token.parse().map_err(|_| invalid("malformed xid"))?;
            return Ok(Revision::new(xid, PgSnapshot::complete_through(xid.0)));
        }

        Err(invalid("unrecognized revision format"))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}@{}", TOKEN_PREFIX, self.xid, self.snapshot)
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Revision::parse_token(&token).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn snapshot(xmin: u64, xmax: u64, xips: &[u64]) -> PgSnapshot {
        PgSnapshot::new(xmin, xmax, xips.to_vec())
    }

    #[test]
    fn test_visibility() {
        let snap = snapshot(700, 710, &[703, 707]);
        assert!(snap.visible(Xid(699)));
        assert!(snap.visible(Xid(700)));
        assert!(!snap.visible(Xid(703)));
        assert!(snap.visible(Xid(704)));
        assert!(!snap.visible(Xid(707)));
        assert!(!snap.visible(Xid(710)));
        assert!(!snap.visible(Xid(711)));
    }

    #[test]
    fn test_mark_complete_within_range() {
        let snap = snapshot(700, 710, &[703, 707]);
        let updated = snap.mark_complete(Xid(703));
        assert!(updated.visible(Xid(703)));
        assert!(!updated.visible(Xid(707)));
        // Other visibility is untouched.
        assert!(updated.visible(Xid(702)));
        assert!(!updated.visible(Xid(710)));
    }

    #[test]
    fn test_mark_complete_beyond_horizon() {
        let snap = snapshot(705, 705, &[]);
        let updated = snap.mark_complete(Xid(708));
        assert!(updated.visible(Xid(708)));
        // The skipped-over xids stay invisible.
        assert!(!updated.visible(Xid(705)));
        assert!(!updated.visible(Xid(706)));
        assert!(!updated.visible(Xid(707)));
        assert!(updated.visible(Xid(704)));
    }

    #[test]
    fn test_mark_in_progress_below_xmin() {
        let snap = snapshot(705, 705, &[]);
        let updated = snap.mark_in_progress(Xid(700));
        assert!(!updated.visible(Xid(700)));
        assert!(updated.visible(Xid(699)));
        assert!(updated.visible(Xid(701)));
    }

    #[test]
    fn test_snapshot_relations() {
        let base = snapshot(700, 705, &[]);
        let later = base.mark_complete(Xid(705));
        assert_eq!(base.relation_to(&base), SnapshotRelation::Equal);
        assert_eq!(later.relation_to(&base), SnapshotRelation::After);
        assert_eq!(base.relation_to(&later), SnapshotRelation::Before);

        // Two writers each seeing only their own commit are concurrent.
        let a = base.mark_complete(Xid(705));
        let b = base.mark_complete(Xid(706));
        let b_only = b.mark_in_progress(Xid(705));
        assert_eq!(a.relation_to(&b_only), SnapshotRelation::Concurrent);
    }

    #[test]
    fn test_snapshot_text_round_trip() {
        for text in ["700:710:703,707", "705:705:", "0:0:"] {
            let parsed: PgSnapshot = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_snapshot_rejects_malformed() {
        for bad in ["", "10", "10:9:", "a:b:", "5:10:11", "5:10:4", "5:10:6,bad"] {
            assert!(bad.parse::<PgSnapshot>().is_err(), "expected failure for `{bad}`");
        }
    }

    #[test]
    fn test_revision_token_round_trip() {
        let rev = Revision::new(Xid(708), snapshot(700, 710, &[703, 707]));
        let token = rev.to_string();
        assert_eq!(token, "pg:708@700:710:703,707");
        let parsed = Revision::parse_token(&token).unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn test_legacy_token() {
        let rev = Revision::parse_token("42").unwrap();
        assert_eq!(rev.xid(), Xid(42));
        assert!(rev.snapshot().visible(Xid(42)));
        assert!(!rev.snapshot().visible(Xid(43)));
    }

    #[test]
    fn test_unknown_formats_rejected() {
        for bad in ["", "mysql:1@2:3:", "pg:1", "pg:@1:2:", "pg:x@1:2:", "1.5", "-3"] {
            assert!(matches!(
                Revision::parse_token(bad),
                Err(StoreError::InvalidRevision { .. })
            ));
        }
    }

    #[test]
    fn test_commit_ordering() {
        // Writer A allocates xid 705, writer B xid 706; A commits first, so
        // B's snapshot (taken at allocation or later) may or may not see A.
        // Once B's commit revision includes A, ordering holds.
        let alloc_a = snapshot(705, 705, &[]);
        let rev_a = Revision::for_committed(Xid(705), alloc_a.clone());
        let alloc_b = alloc_a.mark_complete(Xid(705));
        let rev_b = Revision::for_committed(Xid(706), alloc_b);
        assert!(rev_b.at_or_after(&rev_a));
        assert!(!rev_a.at_or_after(&rev_b));
        assert!(rev_b.greater_than(&rev_a));
    }

    proptest! {
        #[test]
        fn prop_mark_complete_makes_visible(
            xmin in 0u64..1000,
            extra in 0u64..64,
            xid in 0u64..1100,
        ) {
            let snap = snapshot(xmin, xmin + extra, &[]);
            let updated = snap.mark_complete(Xid(xid));
            prop_assert!(updated.visible(Xid(xid)));
            // Marking complete never revokes visibility.
            for probe in 0..(xmin + extra + 4) {
                if snap.visible(Xid(probe)) {
                    prop_assert!(updated.visible(Xid(probe)));
                }
            }
        }

        #[test]
        fn prop_mark_in_progress_inverts(
            xmin in 1u64..1000,
            extra in 1u64..64,
            offset in 0u64..64,
        ) {
            let xid = Xid(xmin.saturating_sub(1) + offset % (extra + 1));
            let snap = snapshot(xmin, xmin + extra, &[]);
            let hidden = snap.mark_in_progress(xid);
            prop_assert!(!hidden.visible(xid));
            let restored = hidden.mark_complete(xid);
            prop_assert!(restored.visible(xid));
        }

        #[test]
        fn prop_token_round_trip(
            xid in 0u64..u64::MAX / 2,
            xmin in 0u64..10_000,
            extra in 0u64..32,
            xips in prop::collection::vec(0u64..10_032, 0..8),
        ) {
            let xips: Vec<u64> = xips
                .into_iter()
                .filter(|&x| x >= xmin && x < xmin + extra)
                .collect();
            let rev = Revision::new(Xid(xid), PgSnapshot::new(xmin, xmin + extra, xips));
            let parsed = Revision::parse_token(&rev.to_string()).unwrap();
            prop_assert_eq!(parsed, rev);
        }

        #[test]
        fn prop_relation_consistency(
            xmin in 0u64..500,
            extra_a in 0u64..32,
            extra_b in 0u64..32,
        ) {
            let a = snapshot(xmin, xmin + extra_a, &[]);
            let b = snapshot(xmin, xmin + extra_b, &[]);
            let forward = a.relation_to(&b);
            let backward = b.relation_to(&a);
            let expected = match forward {
                SnapshotRelation::Equal => SnapshotRelation::Equal,
                SnapshotRelation::After => SnapshotRelation::Before,
                SnapshotRelation::Before => SnapshotRelation::After,
                SnapshotRelation::Concurrent => SnapshotRelation::Concurrent,
            };
            prop_assert_eq!(backward, expected);
        }
    }
}
