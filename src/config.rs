//! Router configuration: every knob the machine protocol and CLI expose.
//!
//! The configuration persists across runs; routing state derived from it
//! (performance table, graph, current route) is invalidated by the
//! controller whenever a routing-relevant value changes.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::aircraft::EngineParams;
use crate::fplan::WaypointKind;
use crate::geom::{Coord, Rect};
use crate::navdata::AirportRecord;
use crate::performance::OptTarget;

/// Radius cap for crossing constraints, nmi
pub const MAX_CROSSING_RADIUS: f64 = 50.0;

/// A mandatory crossing on the route
#[derive(Debug, Clone)]
pub struct Crossing {
    pub ident: String,
    pub coord: Option<Coord>,
    pub kind: WaypointKind,
    pub radius_nmi: f64,
    pub minlevel: i32,
    pub maxlevel: i32,
}

impl Default for Crossing {
    fn default() -> Self {
        Self {
            ident: String::new(),
            coord: None,
            kind: WaypointKind::Undefined,
            radius_nmi: 0.0,
            minlevel: 0,
            maxlevel: 600,
        }
    }
}

impl Crossing {
    pub fn set_radius(&mut self, r: f64) {
        self.radius_nmi = r.clamp(0.0, MAX_CROSSING_RADIUS);
    }

    pub fn set_level(&mut self, minlevel: i32, maxlevel: i32) {
        self.minlevel = minlevel.min(maxlevel);
        self.maxlevel = minlevel.max(maxlevel);
    }
}

/// What an exclusion region refers to
#[derive(Debug, Clone)]
pub enum ExcludeSpec {
    /// Airspace looked up by id and class string
    Airspace { id: String, class: String },
    /// Raw coordinate rectangle
    Bbox(Rect),
}

#[derive(Debug, Clone)]
pub struct ExcludeRegion {
    pub spec: ExcludeSpec,
    pub minlevel: i32,
    pub maxlevel: i32,
    /// Airway segments longer than this survive inside the region; 0 = none
    pub awylimit_nmi: f64,
    pub dctlimit_nmi: f64,
    pub dctoffset: f64,
    pub dctscale: f64,
}

impl ExcludeRegion {
    pub fn new(spec: ExcludeSpec) -> Self {
        Self {
            spec,
            minlevel: 0,
            maxlevel: 999,
            awylimit_nmi: 0.0,
            dctlimit_nmi: 0.0,
            dctoffset: 0.0,
            dctscale: 1.0,
        }
    }
}

/// SID or STAR attachment settings for one endpoint
#[derive(Debug, Clone)]
pub struct ProcAnchor {
    pub coord: Option<Coord>,
    pub ident: String,
    pub kind: WaypointKind,
    /// Maximum anchor distance from the aerodrome, nmi
    pub limit_nmi: f64,
    pub penalty: f64,
    pub offset_nmi: f64,
    pub minimum_nmi: f64,
    /// Attach database-defined procedures
    pub use_db: bool,
    /// Only procedures may leave/enter the aerodrome
    pub proc_only: bool,
    /// Allowed procedure names; empty = all
    pub filter: BTreeSet<String>,
}

impl Default for ProcAnchor {
    fn default() -> Self {
        Self {
            coord: None,
            ident: String::new(),
            kind: WaypointKind::Undefined,
            limit_nmi: 20.0,
            penalty: 1.0,
            offset_nmi: 0.0,
            minimum_nmi: 0.0,
            use_db: true,
            proc_only: false,
            filter: BTreeSet::new(),
        }
    }
}

impl ProcAnchor {
    pub fn clear_anchor(&mut self) {
        self.coord = None;
        self.ident.clear();
        self.kind = WaypointKind::Undefined;
    }

    pub fn allows_procedure(&self, name: &str) -> bool {
        self.filter.is_empty() || self.filter.contains(&name.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidatorChoice {
    Default,
    #[default]
    Cfmu,
    Eurofpl,
}

impl ValidatorChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorChoice::Default => "default",
            ValidatorChoice::Cfmu => "cfmu",
            ValidatorChoice::Eurofpl => "eurofpl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(ValidatorChoice::Default),
            "cfmu" => Some(ValidatorChoice::Cfmu),
            "eurofpl" => Some(ValidatorChoice::Eurofpl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub departure: Option<AirportRecord>,
    pub destination: Option<AirportRecord>,
    pub departure_ifr: bool,
    pub destination_ifr: bool,
    pub force_enroute_ifr: bool,
    pub sid: ProcAnchor,
    pub star: ProcAnchor,
    pub alternates: [String; 2],
    pub crossings: Vec<Crossing>,
    pub dctlimit_nmi: f64,
    pub dctpenalty: f64,
    pub dctoffset: f64,
    pub vfr_airspace_limit_nmi2: f64,
    pub exclude_regions: Vec<ExcludeRegion>,
    pub base_level: i32,
    pub top_level: i32,
    pub max_descent_fpm: f64,
    pub honour_levelchange_trackmiles: bool,
    pub honour_opsperf_trackmiles: bool,
    pub honour_awy_levels: bool,
    pub honour_profile_rules: bool,
    pub preferred_level: i32,
    pub preferred_penalty: f64,
    pub preferred_climb: f64,
    pub preferred_descent: f64,
    pub qnh_hpa: f64,
    pub isa_offset_c: f64,
    pub wind_enabled: bool,
    pub engine: EngineParams,
    pub opt_target: OptTarget,
    pub deptime: DateTime<Utc>,
    pub max_local_iterations: u32,
    pub max_remote_iterations: u32,
    pub validator: ValidatorChoice,
    pub validator_binary: Option<PathBuf>,
    pub validator_socket: Option<String>,
    pub validator_xdisplay: Option<i32>,
    pub tfr_enabled: bool,
    pub disabled_rules: BTreeSet<String>,
    pub trace_rules: BTreeSet<String>,
    pub rules_savefile: Option<PathBuf>,
    pub precomp_graph_enabled: bool,
    pub precomp_graph_path: Option<PathBuf>,
    pub log_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            departure: None,
            destination: None,
            departure_ifr: true,
            destination_ifr: true,
            force_enroute_ifr: false,
            sid: ProcAnchor::default(),
            star: ProcAnchor::default(),
            alternates: [String::new(), String::new()],
            crossings: Vec::new(),
            dctlimit_nmi: 50.0,
            dctpenalty: 1.0,
            dctoffset: 0.0,
            vfr_airspace_limit_nmi2: 0.0,
            exclude_regions: Vec::new(),
            base_level: 50,
            top_level: 120,
            max_descent_fpm: 1000.0,
            honour_levelchange_trackmiles: true,
            honour_opsperf_trackmiles: false,
            honour_awy_levels: true,
            honour_profile_rules: false,
            preferred_level: 100,
            preferred_penalty: 1.1,
            preferred_climb: 3.0,
            preferred_descent: 1.0,
            qnh_hpa: crate::atmosphere::STD_SEALEVEL_PRESSURE,
            isa_offset_c: 0.0,
            wind_enabled: false,
            engine: EngineParams::default(),
            opt_target: OptTarget::Time,
            deptime: default_deptime(Utc::now()),
            max_local_iterations: u32::MAX,
            max_remote_iterations: u32::MAX,
            validator: ValidatorChoice::Cfmu,
            validator_binary: None,
            validator_socket: None,
            validator_xdisplay: None,
            tfr_enabled: true,
            disabled_rules: BTreeSet::new(),
            trace_rules: BTreeSet::new(),
            rules_savefile: None,
            precomp_graph_enabled: false,
            precomp_graph_path: None,
            log_prefix: String::new(),
        }
    }
}

/// Next 10:00 UTC at least one hour ahead
pub fn default_deptime(now: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = now + Duration::hours(1);
    let mut t = earliest
        .with_hour(10)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(earliest);
    if t < earliest {
        t += Duration::days(1);
    }
    t
}

impl RouterConfig {
    pub fn set_levels(&mut self, base: i32, top: i32) {
        self.base_level = base.min(top);
        self.top_level = base.max(top);
    }

    pub fn set_qnh(&mut self, qnh: f64) {
        self.qnh_hpa = qnh.clamp(700.0, 1300.0);
    }

    pub fn set_isa_offset(&mut self, isa: f64) {
        self.isa_offset_c = isa.clamp(-100.0, 100.0);
    }

    pub fn set_crossing_count(&mut self, count: usize) {
        self.crossings.resize_with(count, Crossing::default);
    }

    pub fn bbox(&self) -> Option<Rect> {
        let mut bbox: Option<Rect> = None;
        let mut add = |pt: Coord| {
            bbox = Some(match bbox {
                Some(b) => b.add(pt),
                None => Rect::from_point(pt),
            });
        };
        if let Some(dep) = &self.departure {
            add(dep.coord);
        }
        if let Some(dest) = &self.destination {
            add(dest.coord);
        }
        for c in &self.crossings {
            if let Some(pt) = c.coord {
                for course in [0.0, 90.0, 180.0, 270.0] {
                    add(pt.offset_nmi(course, c.radius_nmi.max(0.0)));
                }
            }
        }
        bbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_levels_swap() {
        let mut cfg = RouterConfig::default();
        cfg.set_levels(250, 100);
        assert_eq!((cfg.base_level, cfg.top_level), (100, 250));
    }

    #[test]
    fn test_qnh_clamped() {
        let mut cfg = RouterConfig::default();
        cfg.set_qnh(200.0);
        assert_eq!(cfg.qnh_hpa, 700.0);
        cfg.set_qnh(2000.0);
        assert_eq!(cfg.qnh_hpa, 1300.0);
    }

    #[test]
    fn test_crossing_radius_cap() {
        let mut c = Crossing::default();
        c.set_radius(75.0);
        assert_eq!(c.radius_nmi, MAX_CROSSING_RADIUS);
        c.set_level(180, 120);
        assert_eq!((c.minlevel, c.maxlevel), (120, 180));
    }

    #[test]
    fn test_default_deptime_next_ten_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 0, 0).unwrap();
        let dep = default_deptime(now);
        assert_eq!(dep.hour(), 10);
        assert!(dep > now + Duration::hours(1));
    }

    #[test]
    fn test_bbox_includes_crossing_radius() {
        let mut cfg = RouterConfig::default();
        cfg.crossings.push(Crossing {
            coord: Some(Coord::new(47.0, 11.0)),
            radius_nmi: 10.0,
            ..Crossing::default()
        });
        let bbox = cfg.bbox().unwrap();
        assert!(bbox.north > 47.1 && bbox.south < 46.9);
    }
}
