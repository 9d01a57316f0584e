//! Compact ICAO flight-plan text.
//!
//! Formats the current route the way the validator expects it, and parses
//! the same shape back (used by local validation and tests). Only the
//! fields this system emits are understood by the parser.

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::aircraft::Aircraft;
use crate::fplan::{FplRoute, PathCode};
use crate::performance::Performance;

static NUMERIC_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());

/// Numeric or degenerate idents never appear in a route string
pub fn is_ident_numeric(ident: &str) -> bool {
    ident.is_empty() || NUMERIC_IDENT.is_match(ident)
}

fn fpl_tas(tas_kts: f64) -> String {
    format!("N{:04}", tas_kts.round() as i64)
}

fn fpl_level(alt_ft: i32, standard: bool) -> String {
    let lvl = (alt_ft + 50) / 100;
    format!("{}{:03}", if standard { 'F' } else { 'A' }, lvl)
}

fn hhmm(t: DateTime<Utc>) -> String {
    format!("{:02}{:02}", t.hour(), t.minute())
}

fn eet_hhmm(secs: f64) -> String {
    let mins = ((secs + 30.0) / 60.0) as i64;
    format!("{:02}{:02}", mins / 60, mins % 60)
}

pub struct FormatParams<'a> {
    pub route: &'a FplRoute,
    pub aircraft: &'a Aircraft,
    pub performance: &'a Performance,
    pub alternates: &'a [String; 2],
    /// Used when the aircraft model carries no callsign
    pub fallback_callsign: &'a str,
    /// Run start, bounds the DOF/ window
    pub started_at: DateTime<Utc>,
    pub pogo: bool,
}

/// Render the current route as a single-line ICAO plan
pub fn format_plan(p: &FormatParams) -> String {
    let route = p.route;
    if p.performance.is_empty() || route.len() < 2 {
        return String::new();
    }
    let dep = &route.waypoints[0];
    let dest = &route.waypoints[route.len() - 1];
    let rules = route.flightrules();
    let callsign = if p.aircraft.callsign.is_empty() {
        p.fallback_callsign
    } else {
        &p.aircraft.callsign
    };

    let mut other = String::new();
    let mut fpl = String::new();
    fpl.push_str("-(FPL-");
    fpl.push_str(callsign);
    fpl.push('-');
    fpl.push(rules);
    fpl.push_str("G -1");
    fpl.push_str(&p.aircraft.icaotype);
    fpl.push('/');
    fpl.push(p.aircraft.wake);
    fpl.push_str(" -");
    fpl.push_str(&p.aircraft.equipment);
    fpl.push('/');
    fpl.push_str(&p.aircraft.transponder);
    fpl.push_str(" -");
    if dep.icao.len() == 4 {
        fpl.push_str(&dep.icao);
    } else {
        fpl.push_str("ZZZZ");
        other.push_str(&format!("DEP/{} ", dep.name));
    }
    if p.aircraft.has_pbn() {
        other.push_str(&format!("PBN/{} ", p.aircraft.pbn));
    }
    let deptime = DateTime::from_timestamp(dep.time_unix, 0).unwrap_or(p.started_at);
    fpl.push_str(&hhmm(deptime));
    fpl.push_str(" -");
    if dep.time_unix >= p.started_at.timestamp() + 3600
        && dep.time_unix <= p.started_at.timestamp() + 5 * 24 * 3600
    {
        other.push_str(&format!(
            "DOF/{:02}{:02}{:02} ",
            deptime.year() % 100,
            deptime.month(),
            deptime.day()
        ));
    }

    // cruise speed and requested level
    let cruise_alt = if route.len() == 2 {
        let mut alt = dep.altitude_ft.max(dest.altitude_ft);
        if alt >= 5000 {
            alt += 1000;
        }
        (alt + 1999) / 1000 * 1000
    } else {
        route.waypoints[1].altitude_ft
    };
    let pi = p.performance.find_cruise_index(cruise_alt as f64);
    let tas = p
        .performance
        .cruise(pi)
        .map(|c| c.tas_kts())
        .unwrap_or(100.0);
    fpl.push_str(&fpl_tas(tas));
    if rules == 'V' {
        fpl.push_str("VFR");
    } else {
        fpl.push_str(&fpl_level(cruise_alt, route.waypoints[1.min(route.len() - 1)].standard));
    }

    let mut eet = String::new();
    if route.len() == 2 {
        if dep.ifr && dest.ifr {
            fpl.push_str(" DCT");
        }
    } else {
        match dep.pathcode {
            PathCode::DirectTo => fpl.push_str(" DCT"),
            PathCode::Sid => {
                fpl.push(' ');
                fpl.push_str(&dep.pathname);
            }
            _ => {}
        }
        let mut alt = route.waypoints[1].altitude_ft;
        let mut ifr = dep.ifr;
        for idx in 1..route.len() - 1 {
            let wpt = &route.waypoints[idx];
            let prev = &route.waypoints[idx - 1];
            let ident = wpt.route_ident();
            // drop unnamed/numeric points inside a continuous airway
            if is_ident_numeric(ident)
                || (ident.len() < 2
                    && wpt.pathcode == PathCode::Airway
                    && prev.pathcode == PathCode::Airway
                    && wpt.pathname == prev.pathname)
            {
                continue;
            }
            fpl.push(' ');
            fpl.push_str(ident);
            if wpt.altitude_ft != alt {
                let pi = p.performance.find_cruise_index(wpt.altitude_ft as f64);
                let t = p
                    .performance
                    .cruise(pi)
                    .map(|c| c.tas_kts())
                    .unwrap_or(tas);
                fpl.push('/');
                fpl.push_str(&fpl_tas(t));
                fpl.push_str(&fpl_level(wpt.altitude_ft, wpt.standard));
                alt = wpt.altitude_ft;
            }
            if wpt.ifr != ifr {
                ifr = wpt.ifr;
                fpl.push_str(if ifr { " IFR" } else { " VFR" });
                if ifr {
                    eet.push_str(&format!(
                        "{}{} ",
                        ident,
                        eet_hhmm(wpt.flighttime_sec as f64)
                    ));
                }
            }
            match wpt.pathcode {
                PathCode::DirectTo => fpl.push_str(" DCT"),
                PathCode::Airway | PathCode::Star => {
                    fpl.push(' ');
                    fpl.push_str(&wpt.pathname);
                }
                _ => {}
            }
        }
    }
    fpl.push_str(" -");
    if dest.icao.len() == 4 {
        fpl.push_str(&dest.icao);
    } else {
        fpl.push_str("ZZZZ");
        other.push_str(&format!("DEST/{} ", dest.name));
    }
    fpl.push_str(&eet_hhmm(route.zerowind_time_sec));
    for alt in p.alternates.iter().filter(|a| !a.is_empty()) {
        fpl.push(' ');
        fpl.push_str(alt);
    }
    fpl.push_str(" -");
    fpl.push_str(&other);
    if !eet.is_empty() {
        fpl.push_str("EET/");
        fpl.push_str(&eet);
    }
    if p.pogo && dep.ifr && dest.ifr {
        fpl.push_str(" RMK/POGO");
    }
    fpl.push(')');
    fpl
}

/// The subset of a parsed plan the engine compares against
#[derive(Debug, Clone, Default)]
pub struct ParsedPlan {
    pub callsign: String,
    pub flightrules: char,
    pub departure: String,
    pub destination: String,
    pub eet_minutes: u32,
    /// Route fix idents in order, excluding airway designators and DCT
    pub fixes: Vec<String>,
}

/// Parse a plan produced by [`format_plan`]
pub fn parse_plan(text: &str) -> Result<ParsedPlan> {
    let inner = text
        .trim()
        .strip_prefix("-(FPL-")
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| anyhow::anyhow!("not an FPL string"))?;
    let fields: Vec<&str> = inner.split(" -").collect();
    if fields.len() < 6 {
        bail!("truncated FPL string: {} fields", fields.len());
    }
    let mut plan = ParsedPlan::default();
    {
        let mut it = fields[0].splitn(2, '-');
        plan.callsign = it.next().unwrap_or("").to_string();
        plan.flightrules = it.next().and_then(|r| r.chars().next()).unwrap_or('I');
    }
    plan.departure = fields[3].chars().take(4).collect();
    {
        let routefield = fields[4];
        let mut tokens = routefield.split_whitespace();
        // leading speed/level group
        let _ = tokens.next();
        let mut expect_fix = false;
        for tok in tokens {
            if expect_fix {
                let ident = tok.split('/').next().unwrap_or(tok);
                if ident != "IFR" && ident != "VFR" {
                    plan.fixes.push(ident.to_string());
                    expect_fix = false;
                }
            } else if tok != "IFR" && tok != "VFR" {
                // path token: DCT, airway or procedure designator
                expect_fix = true;
            }
        }
    }
    {
        let destfield = fields[5].split_whitespace().next().unwrap_or("");
        plan.destination = destfield.chars().take(4).collect();
        let digits: String = destfield.chars().skip(4).take(4).collect();
        if digits.len() == 4
            && let (Ok(h), Ok(m)) = (digits[0..2].parse::<u32>(), digits[2..4].parse::<u32>())
        {
            plan.eet_minutes = h * 60 + m;
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fplan::FplWaypoint;
    use crate::geom::Coord;
    use crate::performance::{PerfSpec, Performance};
    use crate::opsperf::OpsPerfDb;
    use crate::wind::NullWeatherProvider;

    fn perf() -> Performance {
        Performance::build(
            &PerfSpec {
                base_level: 50,
                top_level: 150,
                ..PerfSpec::default()
            },
            &Aircraft::default(),
            &OpsPerfDb::new().find_aircraft("P28R"),
            &NullWeatherProvider,
        )
    }

    fn wpt(icao: &str, path: PathCode, pathname: &str, alt: i32) -> FplWaypoint {
        FplWaypoint {
            icao: icao.into(),
            pathcode: path,
            pathname: pathname.into(),
            altitude_ft: alt,
            standard: true,
            ifr: true,
            coord: Coord::new(47.0, 8.0),
            ..FplWaypoint::default()
        }
    }

    fn sample_route() -> FplRoute {
        let mut r = FplRoute::new();
        r.waypoints.push(wpt("LSZH", PathCode::Sid, "VEBIT1G", 1400));
        r.waypoints.push(wpt("VEBIT", PathCode::Airway, "UL613", 10000));
        r.waypoints.push(wpt("SOPER", PathCode::DirectTo, "", 10000));
        r.waypoints.push(wpt("ODINA", PathCode::Star, "ODINA2A", 10000));
        r.waypoints.push(wpt("LIMC", PathCode::None, "", 800));
        r.zerowind_time_sec = 4120.0;
        r.route_time_sec = 4000.0;
        for w in r.waypoints.iter_mut() {
            w.time_unix = 1_700_000_000;
        }
        r
    }

    #[test]
    fn test_format_contains_route_elements() {
        let perf = perf();
        let route = sample_route();
        let alternates = [String::from("LSZA"), String::new()];
        let text = format_plan(&FormatParams {
            route: &route,
            aircraft: &Aircraft::default(),
            performance: &perf,
            alternates: &alternates,
            fallback_callsign: "HB9999",
            started_at: Utc::now(),
            pogo: false,
        });
        assert!(text.starts_with("-(FPL-"));
        assert!(text.contains("VEBIT1G"), "{text}");
        assert!(text.contains("VEBIT UL613"), "{text}");
        assert!(text.contains("SOPER DCT"), "{text}");
        assert!(text.contains("ODINA ODINA2A"), "{text}");
        assert!(text.contains("-LIMC"), "{text}");
        assert!(text.contains("LSZA"), "{text}");
    }

    #[test]
    fn test_roundtrip_fix_list_and_eet() {
        let perf = perf();
        let route = sample_route();
        let alternates = [String::new(), String::new()];
        let text = format_plan(&FormatParams {
            route: &route,
            aircraft: &Aircraft::default(),
            performance: &perf,
            alternates: &alternates,
            fallback_callsign: "HB9999",
            started_at: Utc::now(),
            pogo: false,
        });
        let parsed = parse_plan(&text).unwrap();
        assert_eq!(parsed.departure, "LSZH");
        assert_eq!(parsed.destination, "LIMC");
        assert_eq!(parsed.fixes, vec!["VEBIT", "SOPER", "ODINA"]);
        // zero-wind EET 4120 s is 69 min; round trip within one minute
        assert!((parsed.eet_minutes as i64 - 69).abs() <= 1);
    }

    #[test]
    fn test_pogo_remark() {
        let perf = perf();
        let mut route = sample_route();
        route.waypoints.truncate(2);
        route.waypoints[0].pathcode = PathCode::DirectTo;
        let alternates = [String::new(), String::new()];
        let text = format_plan(&FormatParams {
            route: &route,
            aircraft: &Aircraft::default(),
            performance: &perf,
            alternates: &alternates,
            fallback_callsign: "HB9999",
            started_at: Utc::now(),
            pogo: true,
        });
        assert!(text.contains("RMK/POGO"), "{text}");
        assert!(text.contains(" DCT"), "{text}");
    }

    #[test]
    fn test_numeric_ident_detection() {
        assert!(is_ident_numeric("1234"));
        assert!(is_ident_numeric(""));
        assert!(!is_ident_numeric("VEBIT"));
        assert!(!is_ident_numeric("D123"));
    }
}
