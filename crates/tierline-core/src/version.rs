//! Release versioning.
//!
//! Versions are `MAJOR.MINOR.PATCH` with an optional pre-release suffix
//! (`-rc.N`, `-hotfix.<ms>`, `-rollback.<ms>`). Ordering follows SemVer 2.0
//! precedence. The [`VersionManager`] computes the next version for a
//! request and refuses any candidate that does not sort strictly above the
//! latest release in the target lineage.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tierline_state::{ReleaseKind, ReleaseRecord};

use crate::domain::{DeployError, Result};

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// One dot-separated pre-release identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alpha(_)) => Ordering::Less,
            (Identifier::Alpha(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alpha(a), Identifier::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{}", n),
            Identifier::Alpha(s) => f.write_str(s),
        }
    }
}

/// A parsed release version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<Identifier>,
}

/// Which core component to increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bump {
    Major,
    Minor,
    Patch,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
        }
    }

    /// Parse `1.2.3`, `v1.2.3` or `1.2.3-rc.1`. Build metadata is ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed =
            |why: &str| DeployError::MalformedEvent(format!("invalid version '{}': {}", input, why));

        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let body = body.split_once('+').map(|(v, _)| v).unwrap_or(body);
        let (core, pre) = match body.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (body, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(malformed("expected MAJOR.MINOR.PATCH"));
        }
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(malformed("core components must be numeric"));
            }
            *slot = part
                .parse::<u64>()
                .map_err(|_| malformed("core component out of range"))?;
        }

        let pre = match pre {
            None => Vec::new(),
            Some(pre) => pre
                .split('.')
                .map(|ident| parse_identifier(ident).ok_or_else(|| malformed("bad pre-release")))
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre,
        })
    }

    /// The same version without its pre-release suffix.
    pub fn core(&self) -> Version {
        Version::new(self.major, self.minor, self.patch)
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    /// Increment one component and zero everything below it. Fails when
    /// the component is already at `u64::MAX`.
    pub fn bump(&self, bump: Bump) -> Result<Version> {
        let next = match bump {
            Bump::Major => increment(self.major).map(|major| Version::new(major, 0, 0)),
            Bump::Minor => increment(self.minor).map(|minor| Version::new(self.major, minor, 0)),
            Bump::Patch => {
                increment(self.patch).map(|patch| Version::new(self.major, self.minor, patch))
            }
        };
        next.ok_or_else(|| {
            DeployError::MalformedEvent(format!("cannot bump {}: component overflow", self))
        })
    }

    /// Append `label.n` to the pre-release.
    pub fn with_suffix(&self, label: &str, n: u64) -> Version {
        let mut next = self.clone();
        next.pre.push(Identifier::Alpha(label.to_string()));
        next.pre.push(Identifier::Numeric(n));
        next
    }

    /// Release type implied by the suffix.
    pub fn kind(&self) -> ReleaseKind {
        if self.pre.iter().any(|i| is_label(i, "rollback")) {
            return ReleaseKind::Rollback;
        }
        match self.pre.first() {
            Some(first) if is_label(first, "hotfix") => ReleaseKind::Hotfix,
            Some(first) if is_label(first, "rc") => ReleaseKind::Rc,
            _ => ReleaseKind::Standard,
        }
    }

    /// `N` of an `-rc.N` suffix.
    pub fn rc_number(&self) -> Option<u64> {
        match self.pre.as_slice() {
            [label, Identifier::Numeric(n)] if is_label(label, "rc") => Some(*n),
            _ => None,
        }
    }
}

fn increment(n: u64) -> Option<u64> {
    n.checked_add(1)
}

fn is_label(ident: &Identifier, label: &str) -> bool {
    matches!(ident, Identifier::Alpha(s) if s == label)
}

fn parse_identifier(raw: &str) -> Option<Identifier> {
    if raw.is_empty()
        || !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return None;
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse::<u64>().ok().map(Identifier::Numeric)
    } else {
        Some(Identifier::Alpha(raw.to_string()))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                // A pre-release sorts below the same release.
                (false, true) => Ordering::Less,
                (true, false) => Ordering::Greater,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            let pre: Vec<String> = self.pre.iter().map(|i| i.to_string()).collect();
            write!(f, "-{}", pre.join("."))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Version {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// What kind of version the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionRequest {
    Major,
    Minor,
    Patch,
    Rc,
    Hotfix,
    Exact(Version),
}

impl VersionRequest {
    /// `major|minor|patch|rc|hotfix`, or anything parseable as a version.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "major" => Ok(VersionRequest::Major),
            "minor" => Ok(VersionRequest::Minor),
            "patch" => Ok(VersionRequest::Patch),
            "rc" => Ok(VersionRequest::Rc),
            "hotfix" => Ok(VersionRequest::Hotfix),
            other => Version::parse(other).map(VersionRequest::Exact),
        }
    }

    pub fn kind(&self) -> ReleaseKind {
        match self {
            VersionRequest::Major | VersionRequest::Minor | VersionRequest::Patch => {
                ReleaseKind::Standard
            }
            VersionRequest::Rc => ReleaseKind::Rc,
            VersionRequest::Hotfix => ReleaseKind::Hotfix,
            VersionRequest::Exact(v) => v.kind(),
        }
    }
}

impl std::fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionRequest::Major => f.write_str("major"),
            VersionRequest::Minor => f.write_str("minor"),
            VersionRequest::Patch => f.write_str("patch"),
            VersionRequest::Rc => f.write_str("rc"),
            VersionRequest::Hotfix => f.write_str("hotfix"),
            VersionRequest::Exact(v) => write!(f, "{}", v),
        }
    }
}

/// A validated candidate version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedVersion {
    pub version: Version,
    pub kind: ReleaseKind,
    /// Latest version in the lineage when the candidate was computed.
    pub previous: Option<Version>,
}

// ---------------------------------------------------------------------------
// VersionManager
// ---------------------------------------------------------------------------

/// Computes and validates release versions.
///
/// Holds a monotonic millisecond stamp so that timestamp suffixes stay
/// unique across calls landing in the same millisecond.
#[derive(Debug, Default)]
pub struct VersionManager {
    last_stamp: AtomicI64,
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max(now_ms, previous + 1)`.
    pub fn stamp(&self, now: DateTime<Utc>) -> u64 {
        let now_ms = now.timestamp_millis();
        let mut previous = self.last_stamp.load(AtomicOrdering::SeqCst);
        loop {
            let candidate = now_ms.max(previous + 1);
            match self.last_stamp.compare_exchange(
                previous,
                candidate,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return candidate.max(0) as u64,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Highest version in a lineage, ignoring rollback tags.
    pub fn latest(lineage: &[ReleaseRecord]) -> Option<Version> {
        lineage
            .iter()
            .filter(|r| r.kind != ReleaseKind::Rollback)
            .filter_map(|r| match Version::parse(&r.version) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(version = %r.version, error = %e, "skipping unparseable release");
                    None
                }
            })
            .max()
    }

    /// Compute the candidate for `request` and check it against the lineage.
    pub fn next(
        &self,
        request: &VersionRequest,
        lineage: &[ReleaseRecord],
        now: DateTime<Utc>,
    ) -> Result<PlannedVersion> {
        let previous = Self::latest(lineage);
        let base = previous.clone().unwrap_or(Version::new(0, 0, 0));

        let version = match request {
            VersionRequest::Major => base.bump(Bump::Major)?,
            VersionRequest::Minor => base.bump(Bump::Minor)?,
            VersionRequest::Patch => base.bump(Bump::Patch)?,
            VersionRequest::Rc => match base.rc_number() {
                Some(n) => {
                    let n = increment(n).ok_or_else(|| {
                        DeployError::MalformedEvent(format!("cannot bump {}: rc overflow", base))
                    })?;
                    base.core().with_suffix("rc", n)
                }
                None => base.bump(Bump::Minor)?.with_suffix("rc", 1),
            },
            VersionRequest::Hotfix => {
                let core = if base.kind() == ReleaseKind::Hotfix {
                    base.core()
                } else {
                    base.bump(Bump::Patch)?
                };
                core.with_suffix("hotfix", self.stamp(now))
            }
            VersionRequest::Exact(v) => v.clone(),
        };

        Self::ensure_ascending(&version, previous.as_ref())?;

        Ok(PlannedVersion {
            kind: request.kind(),
            version,
            previous,
        })
    }

    /// Traceable `<target>-rollback.<ms>` tag. Not checked against the lineage.
    pub fn rollback_tag(&self, target: &Version, now: DateTime<Utc>) -> Version {
        target.with_suffix("rollback", self.stamp(now))
    }

    fn ensure_ascending(candidate: &Version, latest: Option<&Version>) -> Result<()> {
        match latest {
            Some(latest) if candidate <= latest => Err(DeployError::VersionRegression {
                candidate: candidate.to_string(),
                latest: latest.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierline_state::RunId;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn lineage(versions: &[(&str, ReleaseKind)]) -> Vec<ReleaseRecord> {
        versions
            .iter()
            .map(|(version, kind)| ReleaseRecord {
                environment: "prod".to_string(),
                version: version.to_string(),
                kind: *kind,
                source_revision: "abc".to_string(),
                created_by: "ci".to_string(),
                run_id: RunId::new(),
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(v("v1.2.3"), Version::new(1, 2, 3));
        assert_eq!(v("1.2.3-rc.4").to_string(), "1.2.3-rc.4");
        assert_eq!(v("1.2.3+build.5").to_string(), "1.2.3");
        assert!(Version::parse("1.2").is_err());
        assert!(Version::parse("1.x.3").is_err());
        assert!(Version::parse("1.2.3-").is_err());
        assert!(Version::parse("1.2.3-rc..1").is_err());
    }

    #[test]
    fn test_semver_precedence() {
        let ordered = [
            "1.0.0-alpha",
            "1.0.0-alpha.1",
            "1.0.0-alpha.beta",
            "1.0.0-beta",
            "1.0.0-beta.2",
            "1.0.0-beta.11",
            "1.0.0-rc.1",
            "1.0.0",
            "1.0.1",
            "1.1.0",
            "2.0.0",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_kind_from_suffix() {
        assert_eq!(v("1.0.0").kind(), ReleaseKind::Standard);
        assert_eq!(v("1.0.0-rc.2").kind(), ReleaseKind::Rc);
        assert_eq!(v("1.0.1-hotfix.17").kind(), ReleaseKind::Hotfix);
        assert_eq!(v("1.0.0-rollback.17").kind(), ReleaseKind::Rollback);
        assert_eq!(v("1.0.1-hotfix.17.rollback.18").kind(), ReleaseKind::Rollback);
    }

    #[test]
    fn test_bump_zeroes_lower_components() {
        let manager = VersionManager::new();
        let history = lineage(&[("1.4.7", ReleaseKind::Standard)]);
        let now = Utc::now();

        let major = manager.next(&VersionRequest::Major, &history, now).unwrap();
        assert_eq!(major.version, v("2.0.0"));
        let minor = manager.next(&VersionRequest::Minor, &history, now).unwrap();
        assert_eq!(minor.version, v("1.5.0"));
        let patch = manager.next(&VersionRequest::Patch, &history, now).unwrap();
        assert_eq!(patch.version, v("1.4.8"));
        assert_eq!(patch.previous, Some(v("1.4.7")));
    }

    #[test]
    fn test_bump_overflow_is_an_error() {
        let manager = VersionManager::new();
        let top = format!("1.{}.{}", u64::MAX, u64::MAX);
        let history = lineage(&[(top.as_str(), ReleaseKind::Standard)]);
        let now = Utc::now();

        let err = manager.next(&VersionRequest::Patch, &history, now).unwrap_err();
        assert_eq!(err.code(), "malformed_event");
        assert!(manager.next(&VersionRequest::Minor, &history, now).is_err());
        assert_eq!(
            manager.next(&VersionRequest::Major, &history, now).unwrap().version,
            v("2.0.0")
        );

        let top_rc = format!("1.0.0-rc.{}", u64::MAX);
        let rc = lineage(&[(top_rc.as_str(), ReleaseKind::Rc)]);
        assert!(manager.next(&VersionRequest::Rc, &rc, now).is_err());
    }

    #[test]
    fn test_empty_lineage_starts_from_zero() {
        let manager = VersionManager::new();
        let planned = manager.next(&VersionRequest::Patch, &[], Utc::now()).unwrap();
        assert_eq!(planned.version, v("0.0.1"));
        assert_eq!(planned.previous, None);
    }

    #[test]
    fn test_rc_sequence() {
        let manager = VersionManager::new();
        let now = Utc::now();
        let first = manager
            .next(&VersionRequest::Rc, &lineage(&[("1.2.0", ReleaseKind::Standard)]), now)
            .unwrap();
        assert_eq!(first.version, v("1.3.0-rc.1"));
        assert_eq!(first.kind, ReleaseKind::Rc);

        let second = manager
            .next(
                &VersionRequest::Rc,
                &lineage(&[("1.3.0-rc.1", ReleaseKind::Rc), ("1.2.0", ReleaseKind::Standard)]),
                now,
            )
            .unwrap();
        assert_eq!(second.version, v("1.3.0-rc.2"));
    }

    #[test]
    fn test_hotfix_suffixes_are_unique_within_one_millisecond() {
        let manager = VersionManager::new();
        let history = lineage(&[("1.3.0", ReleaseKind::Standard)]);
        let now = Utc::now();

        let a = manager.next(&VersionRequest::Hotfix, &history, now).unwrap();
        let b = manager.next(&VersionRequest::Hotfix, &history, now).unwrap();
        assert_ne!(a.version, b.version);
        assert_eq!(a.version.core(), v("1.3.1"));
        assert!(a.version > v("1.3.0"));
        assert_eq!(a.kind, ReleaseKind::Hotfix);
    }

    #[test]
    fn test_hotfix_on_hotfix_keeps_core() {
        let manager = VersionManager::new();
        let history = lineage(&[("1.3.1-hotfix.100", ReleaseKind::Hotfix)]);
        let planned = manager
            .next(&VersionRequest::Hotfix, &history, Utc::now())
            .unwrap();
        assert_eq!(planned.version.core(), v("1.3.1"));
        assert!(planned.version > v("1.3.1-hotfix.100"));
    }

    #[test]
    fn test_exact_regression_is_rejected() {
        let manager = VersionManager::new();
        let history = lineage(&[("1.3.0", ReleaseKind::Standard)]);
        for candidate in ["1.3.0", "1.2.9", "1.3.0-rc.9"] {
            let err = manager
                .next(&VersionRequest::Exact(v(candidate)), &history, Utc::now())
                .unwrap_err();
            assert_eq!(err.code(), "version_regression");
        }
        assert!(manager
            .next(&VersionRequest::Exact(v("1.3.1")), &history, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_rollback_tags_are_outside_the_lineage() {
        let history = lineage(&[
            ("1.2.0-rollback.999", ReleaseKind::Rollback),
            ("1.3.0", ReleaseKind::Standard),
        ]);
        assert_eq!(VersionManager::latest(&history), Some(v("1.3.0")));

        let manager = VersionManager::new();
        let tag = manager.rollback_tag(&v("1.2.0"), Utc::now());
        assert_eq!(tag.kind(), ReleaseKind::Rollback);
        assert_eq!(tag.core(), v("1.2.0"));
        assert!(tag.to_string().starts_with("1.2.0-rollback."));
    }

    #[test]
    fn test_version_request_parse() {
        assert_eq!(VersionRequest::parse("minor").unwrap(), VersionRequest::Minor);
        assert_eq!(
            VersionRequest::parse("v2.0.0").unwrap(),
            VersionRequest::Exact(v("2.0.0"))
        );
        assert!(VersionRequest::parse("sideways").is_err());
    }
}
