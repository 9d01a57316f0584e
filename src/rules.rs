//! Diagnostic mapper: validator messages become graph mutations.
//!
//! Each diagnostic line has the shape `<code>: <text>`. A table of
//! `(regex, builder)` rules, registered once at startup, extracts the
//! parameters and proposes at most one mutation per line. When several
//! rules match, the earliest registered wins. A given line never produces
//! the same mutation twice within a run, and rule codes can be disabled
//! (ignored) or traced (logged verbosely) per session.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

static CODE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<code>[A-Z]{2,8}\d{0,4}):\s*(?P<text>.*)$").unwrap());

/// Validator acceptance line
pub fn is_acceptance(line: &str) -> bool {
    let up = line.trim().to_ascii_uppercase();
    up == "NO ERRORS" || up.starts_with("NO ERRORS") || up == "+OK" || up == "VALID"
}

/// One graph (or configuration) mutation proposed by a diagnostic
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    RemoveSid { name: String },
    RemoveStar { name: String },
    RestrictAirwayBand { airway: String, from_fl: i32, to_fl: i32 },
    RemoveAirway { airway: String },
    RemoveDct { from: String, to: String },
    RaiseAirwayBase { airway: String, fl: i32 },
    ClosePoint { ident: String },
    EnableProfileRules { rule: String },
    AddCrossing { ident: String },
    LowerTopLevel { fl: i32 },
}

impl fmt::Display for GraphMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphMutation::RemoveSid { name } => write!(f, "remove SID {name}"),
            GraphMutation::RemoveStar { name } => write!(f, "remove STAR {name}"),
            GraphMutation::RestrictAirwayBand {
                airway,
                from_fl,
                to_fl,
            } => write!(f, "close {airway} F{from_fl:03}..F{to_fl:03}"),
            GraphMutation::RemoveAirway { airway } => write!(f, "remove airway {airway}"),
            GraphMutation::RemoveDct { from, to } => write!(f, "remove DCT {from} {to}"),
            GraphMutation::RaiseAirwayBase { airway, fl } => {
                write!(f, "raise {airway} base to F{fl:03}")
            }
            GraphMutation::ClosePoint { ident } => write!(f, "close point {ident}"),
            GraphMutation::EnableProfileRules { rule } => {
                write!(f, "enable profile rules ({rule})")
            }
            GraphMutation::AddCrossing { ident } => write!(f, "require overfly {ident}"),
            GraphMutation::LowerTopLevel { fl } => write!(f, "cap top level at F{fl:03}"),
        }
    }
}

/// Outcome of mapping one line
#[derive(Debug, Clone, Default)]
pub struct MapOutcome {
    pub code: String,
    pub mutation: Option<GraphMutation>,
    pub traced: bool,
}

struct Rule {
    family: &'static str,
    regex: Regex,
    build: fn(&Captures) -> Option<GraphMutation>,
}

fn cap(c: &Captures, name: &str) -> String {
    c.name(name).map(|m| m.as_str().to_string()).unwrap_or_default()
}

fn cap_i32(c: &Captures, name: &str) -> Option<i32> {
    c.name(name).and_then(|m| m.as_str().parse().ok())
}

/// The built-in rule table. Registration order is the tie-break order.
fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule {
            family: "sid",
            regex: Regex::new(r"(?P<name>[A-Z][A-Z0-9]+) IS NOT A VALID SID FOR [A-Z]{4}")
                .unwrap(),
            build: |c| {
                Some(GraphMutation::RemoveSid {
                    name: cap(c, "name"),
                })
            },
        },
        Rule {
            family: "star",
            regex: Regex::new(r"(?P<name>[A-Z][A-Z0-9]+) IS NOT A VALID STAR FOR [A-Z]{4}")
                .unwrap(),
            build: |c| {
                Some(GraphMutation::RemoveStar {
                    name: cap(c, "name"),
                })
            },
        },
        Rule {
            family: "awyband",
            regex: Regex::new(
                r"(?:ROUTE )?(?P<awy>[A-Z]+\d+[A-Z0-9]*) (?:IS )?CLOSED BETWEEN FL(?P<from>\d+) AND FL(?P<to>\d+)",
            )
            .unwrap(),
            build: |c| {
                Some(GraphMutation::RestrictAirwayBand {
                    airway: cap(c, "awy"),
                    from_fl: cap_i32(c, "from")?,
                    to_fl: cap_i32(c, "to")?,
                })
            },
        },
        Rule {
            family: "awyclosed",
            regex: Regex::new(r"ROUTE (?P<awy>[A-Z]+\d+[A-Z0-9]*) (?:IS )?CLOSED").unwrap(),
            build: |c| {
                Some(GraphMutation::RemoveAirway {
                    airway: cap(c, "awy"),
                })
            },
        },
        Rule {
            family: "dct",
            regex: Regex::new(
                r"DCT (?:IS )?NOT (?:ALLOWED|AVAILABLE) FROM (?P<a>[A-Z0-9]+) TO (?P<b>[A-Z0-9]+)",
            )
            .unwrap(),
            build: |c| {
                Some(GraphMutation::RemoveDct {
                    from: cap(c, "a"),
                    to: cap(c, "b"),
                })
            },
        },
        Rule {
            family: "awyfloor",
            regex: Regex::new(r"ROUTE (?P<awy>[A-Z]+\d+[A-Z0-9]*) REQUIRES FL(?P<fl>\d+)")
                .unwrap(),
            build: |c| {
                Some(GraphMutation::RaiseAirwayBase {
                    airway: cap(c, "awy"),
                    fl: cap_i32(c, "fl")?,
                })
            },
        },
        Rule {
            family: "point",
            regex: Regex::new(r"POINT (?P<fix>[A-Z0-9]+) (?:IS )?CLOSED").unwrap(),
            build: |c| {
                Some(GraphMutation::ClosePoint {
                    ident: cap(c, "fix"),
                })
            },
        },
        Rule {
            family: "profile",
            regex: Regex::new(r"PROFILE RULE (?P<rule>[A-Z0-9_]+)").unwrap(),
            build: |c| {
                Some(GraphMutation::EnableProfileRules {
                    rule: cap(c, "rule"),
                })
            },
        },
        Rule {
            family: "overfly",
            regex: Regex::new(r"OVERFLY REQUIRED:? (?P<fix>[A-Z0-9]+)").unwrap(),
            build: |c| {
                Some(GraphMutation::AddCrossing {
                    ident: cap(c, "fix"),
                })
            },
        },
        Rule {
            family: "maxfl",
            regex: Regex::new(r"MAXIMUM FL\s?(?P<fl>\d+)").unwrap(),
            build: |c| Some(GraphMutation::LowerTopLevel { fl: cap_i32(c, "fl")? }),
        },
    ]
}

pub struct DiagnosticMapper {
    rules: Vec<Rule>,
    applied: HashSet<String>,
    pub disabled: BTreeSet<String>,
    pub trace: BTreeSet<String>,
}

impl Default for DiagnosticMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticMapper {
    pub fn new() -> Self {
        Self {
            rules: builtin_rules(),
            applied: HashSet::new(),
            disabled: BTreeSet::new(),
            trace: BTreeSet::new(),
        }
    }

    /// Forget which mutations were already applied (new run)
    pub fn reset(&mut self) {
        self.applied.clear();
    }

    /// Map one diagnostic line to at most one mutation
    pub fn map_line(&mut self, line: &str) -> MapOutcome {
        let line = line.trim();
        let (code, text) = match CODE_SPLIT.captures(line) {
            Some(c) => (cap(&c, "code"), cap(&c, "text")),
            None => (String::new(), line.to_string()),
        };
        let mut out = MapOutcome {
            traced: self.trace.contains(&code),
            code: code.clone(),
            mutation: None,
        };
        if !code.is_empty() && self.disabled.contains(&code) {
            debug!(code, "diagnostic rule disabled, line ignored");
            return out;
        }
        let upper = text.to_ascii_uppercase();
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(&upper) else {
                continue;
            };
            let Some(mutation) = (rule.build)(&caps) else {
                continue;
            };
            let key = format!("{code}|{}|{mutation}", rule.family);
            if self.applied.contains(&key) {
                debug!(code, family = rule.family, "mutation already applied");
                return out;
            }
            self.applied.insert(key);
            metrics::counter!("mapper.mutations_total").increment(1);
            out.mutation = Some(mutation);
            return out;
        }
        out
    }
}

/// Persisted disabled/trace rule sets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSets {
    pub disabled: BTreeSet<String>,
    pub trace: BTreeSet<String>,
}

pub fn save_rulesets<P: AsRef<Path>>(path: P, sets: &RuleSets) -> Result<()> {
    let text = serde_json::to_string_pretty(sets)?;
    std::fs::write(path.as_ref(), text)
        .with_context(|| format!("Failed to write {}", path.as_ref().display()))
}

pub fn load_rulesets<P: AsRef<Path>>(path: P) -> Result<RuleSets> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    serde_json::from_str(&text).context("Malformed rule-set file")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_removal() {
        let mut m = DiagnosticMapper::new();
        let out = m.map_line("SID150: VEBIT1G is not a valid SID for LSZH");
        assert_eq!(out.code, "SID150");
        assert_eq!(
            out.mutation,
            Some(GraphMutation::RemoveSid {
                name: "VEBIT1G".into()
            })
        );
    }

    #[test]
    fn test_airway_band_beats_full_closure() {
        let mut m = DiagnosticMapper::new();
        let out = m.map_line("AWY130: Route UL613 is closed between FL100 and FL240");
        assert_eq!(
            out.mutation,
            Some(GraphMutation::RestrictAirwayBand {
                airway: "UL613".into(),
                from_fl: 100,
                to_fl: 240,
            })
        );
    }

    #[test]
    fn test_airway_full_closure() {
        let mut m = DiagnosticMapper::new();
        let out = m.map_line("AWY131: Route UL612 is closed");
        assert_eq!(
            out.mutation,
            Some(GraphMutation::RemoveAirway {
                airway: "UL612".into()
            })
        );
    }

    #[test]
    fn test_dct_and_point() {
        let mut m = DiagnosticMapper::new();
        assert_eq!(
            m.map_line("DCT140: DCT not allowed from VEBIT to SOPER").mutation,
            Some(GraphMutation::RemoveDct {
                from: "VEBIT".into(),
                to: "SOPER".into()
            })
        );
        assert_eq!(
            m.map_line("PNT120: Point ODINA is closed").mutation,
            Some(GraphMutation::ClosePoint {
                ident: "ODINA".into()
            })
        );
    }

    #[test]
    fn test_floor_overfly_maxfl() {
        let mut m = DiagnosticMapper::new();
        assert_eq!(
            m.map_line("RTE160: Route UN850 requires FL245").mutation,
            Some(GraphMutation::RaiseAirwayBase {
                airway: "UN850".into(),
                fl: 245
            })
        );
        assert_eq!(
            m.map_line("OVF170: Overfly required: KPT").mutation,
            Some(GraphMutation::AddCrossing { ident: "KPT".into() })
        );
        assert_eq!(
            m.map_line("LVL180: Maximum FL195").mutation,
            Some(GraphMutation::LowerTopLevel { fl: 195 })
        );
    }

    #[test]
    fn test_same_line_never_applies_twice() {
        let mut m = DiagnosticMapper::new();
        let line = "AWY131: Route UL612 is closed";
        assert!(m.map_line(line).mutation.is_some());
        assert!(m.map_line(line).mutation.is_none());
        m.reset();
        assert!(m.map_line(line).mutation.is_some());
    }

    #[test]
    fn test_disabled_rule_ignored() {
        let mut m = DiagnosticMapper::new();
        m.disabled.insert("AWY131".into());
        assert!(m.map_line("AWY131: Route UL612 is closed").mutation.is_none());
    }

    #[test]
    fn test_trace_flag() {
        let mut m = DiagnosticMapper::new();
        m.trace.insert("AWY131".into());
        assert!(m.map_line("AWY131: Route UL612 is closed").traced);
    }

    #[test]
    fn test_unmapped_line_recorded_only() {
        let mut m = DiagnosticMapper::new();
        let out = m.map_line("MISC999: something the mapper does not understand");
        assert_eq!(out.code, "MISC999");
        assert!(out.mutation.is_none());
    }

    #[test]
    fn test_acceptance() {
        assert!(is_acceptance("NO ERRORS"));
        assert!(is_acceptance("  no errors  "));
        assert!(!is_acceptance("AWY131: Route UL612 is closed"));
    }

    #[test]
    fn test_ruleset_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let mut sets = RuleSets::default();
        sets.disabled.insert("AWY131".into());
        sets.trace.insert("SID150".into());
        save_rulesets(&path, &sets).unwrap();
        let loaded = load_rulesets(&path).unwrap();
        assert_eq!(loaded.disabled, sets.disabled);
        assert_eq!(loaded.trace, sets.trace);
    }
}
