//! The DB spec string grammar (§4.9/§6.4): `kind [':' loc] ['~' namespace]`,
//! selecting a backend and, for the vector-namespaced forms, a VDB
//! namespace.

use std::fmt;

use crate::embedded::canonicalize_dir;
use crate::error::{CResult, Error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Mem,
    Pebble,
    Firestore,
    /// Any other kind string. Never produced by `parse`, which rejects
    /// unrecognized kinds; exists so a `DbSpec` built programmatically
    /// (rather than parsed) still has a `Display` that never panics.
    Other(String),
}

/// A parsed DB spec string. `namespace` is `None` when no `~` was present
/// and `Some(s)` (possibly empty) when it was — that presence, not the
/// namespace's emptiness, is what the grammar calls `IsVector`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbSpec {
    pub kind: Kind,
    pub loc: String,
    pub namespace: Option<String>,
}

impl DbSpec {
    pub fn is_vector(&self) -> bool {
        self.namespace.is_some()
    }

    pub fn parse(spec: &str) -> CResult<Self> {
        let parse_err = |reason: &str| Error::SpecParse { spec: spec.to_string(), reason: reason.to_string() };

        let (body, namespace) = match spec.split_once('~') {
            Some((body, ns)) => (body, Some(ns.to_string())),
            None => (spec, None),
        };

        let (kind_str, loc) = match body.split_once(':') {
            Some((k, l)) => (k, l.to_string()),
            None => (body, String::new()),
        };

        let kind = match kind_str {
            "mem" => {
                if !loc.is_empty() {
                    return Err(parse_err("\"mem\" does not take a location"));
                }
                Kind::Mem
            }
            "pebble" => {
                if loc.is_empty() {
                    return Err(parse_err("missing directory for \"pebble\""));
                }
                Kind::Pebble
            }
            "firestore" => {
                let (project, database) =
                    loc.split_once(',').ok_or_else(|| parse_err("\"firestore\" requires project,database"))?;
                if project.is_empty() || database.is_empty() {
                    return Err(parse_err("\"firestore\" project and database must be non-empty"));
                }
                Kind::Firestore
            }
            other => return Err(parse_err(&format!("unknown db kind {:?}", other))),
        };

        let loc = if matches!(kind, Kind::Pebble) { canonicalize_dir(&loc) } else { loc };

        Ok(Self { kind, loc, namespace })
    }

    /// Splits a `firestore` spec's `loc` into `(project, database)`.
    /// Callers must have already matched on `Kind::Firestore`.
    pub fn firestore_project_database(&self) -> CResult<(&str, &str)> {
        self.loc
            .split_once(',')
            .ok_or_else(|| Error::Corrupt("firestore db spec missing project,database".into()))
    }
}

impl fmt::Display for DbSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Mem => "mem",
            Kind::Pebble => "pebble",
            Kind::Firestore => "firestore",
            Kind::Other(s) => s.as_str(),
        };
        write!(f, "{}", kind)?;
        if !self.loc.is_empty() {
            write!(f, ":{}", self.loc)?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, "~{}", ns)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DbSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem() {
        let spec = DbSpec::parse("mem").unwrap();
        assert_eq!(spec.kind, Kind::Mem);
        assert!(!spec.is_vector());
    }

    #[test]
    fn parses_mem_with_empty_namespace() {
        let spec = DbSpec::parse("mem~").unwrap();
        assert!(spec.is_vector());
        assert_eq!(spec.namespace.as_deref(), Some(""));
    }

    #[test]
    fn parses_mem_with_namespace() {
        let spec = DbSpec::parse("mem~users").unwrap();
        assert_eq!(spec.namespace.as_deref(), Some("users"));
    }

    #[test]
    fn mem_rejects_location() {
        assert!(DbSpec::parse("mem:/tmp").is_err());
    }

    #[test]
    fn parses_and_canonicalizes_pebble_path() {
        let spec = DbSpec::parse("pebble:/var/./lib//oscar").unwrap();
        assert_eq!(spec.kind, Kind::Pebble);
        assert_eq!(spec.loc, "/var/lib/oscar");
    }

    #[test]
    fn pebble_requires_location() {
        assert!(DbSpec::parse("pebble").is_err());
        assert!(DbSpec::parse("pebble:").is_err());
    }

    #[test]
    fn pebble_preserves_windows_path() {
        let spec = DbSpec::parse(r"pebble:C:\data~v1").unwrap();
        assert_eq!(spec.loc, r"C:\data");
        assert_eq!(spec.namespace.as_deref(), Some("v1"));
    }

    #[test]
    fn parses_firestore() {
        let spec = DbSpec::parse("firestore:proj-1,prod~v1").unwrap();
        assert_eq!(spec.kind, Kind::Firestore);
        assert_eq!(spec.firestore_project_database().unwrap(), ("proj-1", "prod"));
        assert_eq!(spec.namespace.as_deref(), Some("v1"));
    }

    #[test]
    fn firestore_requires_both_parts() {
        assert!(DbSpec::parse("firestore:proj-1").is_err());
        assert!(DbSpec::parse("firestore:,prod").is_err());
        assert!(DbSpec::parse("firestore:proj-1,").is_err());
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        assert!(DbSpec::parse("redis:localhost").is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["mem", "mem~", "mem~users", "pebble:/var/lib/oscar", "firestore:proj-1,prod~v1"] {
            assert_eq!(DbSpec::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn display_never_panics_on_programmatically_built_other_kind() {
        let spec = DbSpec { kind: Kind::Other("weird".into()), loc: "x".into(), namespace: None };
        assert_eq!(spec.to_string(), "weird:x");
    }
}
