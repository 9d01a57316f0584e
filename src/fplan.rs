//! In-memory flight plan route.
//!
//! This is what the solver produces, the weather binder annotates and the
//! ICAO formatter serializes. Totals are re-derived from scratch on every
//! iteration.

use serde::{Deserialize, Serialize};

use crate::geom::Coord;

/// How a waypoint is reached from its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCode {
    Sid,
    Star,
    Airway,
    DirectTo,
    VfrDeparture,
    VfrArrival,
    #[default]
    None,
}

impl PathCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathCode::Sid => "sid",
            PathCode::Star => "star",
            PathCode::Airway => "airway",
            PathCode::DirectTo => "directto",
            PathCode::VfrDeparture => "vfrdeparture",
            PathCode::VfrArrival => "vfrarrival",
            PathCode::None => "none",
        }
    }
}

/// Kind of fix behind a waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaypointKind {
    Airport,
    Navaid,
    Intersection,
    MapElement,
    VfrReportingPoint,
    ProcedureAnchor,
    #[default]
    Undefined,
}

impl WaypointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaypointKind::Airport => "airport",
            WaypointKind::Navaid => "navaid",
            WaypointKind::Intersection => "intersection",
            WaypointKind::MapElement => "mapelement",
            WaypointKind::VfrReportingPoint => "vfrreportingpoint",
            WaypointKind::ProcedureAnchor => "procedureanchor",
            WaypointKind::Undefined => "undefined",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FplWaypoint {
    pub icao: String,
    pub name: String,
    pub pathname: String,
    pub pathcode: PathCode,
    pub kind: WaypointKind,
    pub coord: Coord,
    /// Cruise altitude leaving this waypoint, ft
    pub altitude_ft: i32,
    /// Altitude is a standard-pressure flight level
    pub standard: bool,
    pub ifr: bool,
    pub climb: bool,
    pub descent: bool,
    pub time_unix: i64,
    pub flighttime_sec: u32,
    pub winddir_deg: f64,
    pub windspeed_kts: f64,
    pub qff_hpa: f64,
    pub isaoffset_k: f64,
    pub oat_k: Option<f64>,
    pub truealt_ft: f64,
    /// Leg to the NEXT waypoint
    pub dist_nmi: f64,
    pub truetrack_deg: f64,
    pub trueheading_deg: f64,
    pub tas_kts: f64,
    pub rpm: f64,
    pub mp_inhg: f64,
    /// Cumulative fuel at this waypoint
    pub fuel_usg: f64,
}

impl FplWaypoint {
    /// Ident used in the route string
    pub fn route_ident(&self) -> &str {
        if self.icao.is_empty() {
            &self.name
        } else {
            &self.icao
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FplRoute {
    pub waypoints: Vec<FplWaypoint>,
    pub time_offblock_unix: i64,
    pub time_onblock_unix: i64,
    /// Route totals, seconds / USG, with and without wind
    pub route_time_sec: f64,
    pub route_fuel_usg: f64,
    pub zerowind_time_sec: f64,
    pub zerowind_fuel_usg: f64,
}

impl FplRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn clear(&mut self) {
        self.waypoints.clear();
        self.route_time_sec = 0.0;
        self.route_fuel_usg = 0.0;
        self.zerowind_time_sec = 0.0;
        self.zerowind_fuel_usg = 0.0;
        self.time_onblock_unix = 0;
    }

    pub fn total_distance_nmi(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|w| w[0].coord.distance_nmi(&w[1].coord))
            .sum()
    }

    pub fn gc_distance_nmi(&self) -> f64 {
        match (self.waypoints.first(), self.waypoints.last()) {
            (Some(a), Some(b)) if self.len() >= 2 => a.coord.distance_nmi(&b.coord),
            _ => 0.0,
        }
    }

    /// Highest altitude over the route, ft
    pub fn max_altitude_ft(&self) -> i32 {
        self.waypoints
            .iter()
            .map(|w| w.altitude_ft)
            .max()
            .unwrap_or(0)
    }

    /// Overall flight rules letter: I, V, Y (IFR first) or Z (VFR first)
    pub fn flightrules(&self) -> char {
        let n = self.len();
        if n == 0 {
            return 'V';
        }
        let ifr_count = self.waypoints.iter().filter(|w| w.ifr).count();
        if ifr_count == n {
            'I'
        } else if ifr_count == 0 {
            'V'
        } else if self.waypoints[0].ifr {
            'Y'
        } else {
            'Z'
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wpt(ident: &str, lat: f64, lon: f64, ifr: bool) -> FplWaypoint {
        FplWaypoint {
            icao: ident.into(),
            coord: Coord::new(lat, lon),
            ifr,
            ..FplWaypoint::default()
        }
    }

    #[test]
    fn test_flightrules_letters() {
        let mut r = FplRoute::new();
        assert_eq!(r.flightrules(), 'V');
        r.waypoints.push(wpt("LSZH", 47.46, 8.55, true));
        r.waypoints.push(wpt("LIMC", 45.63, 8.72, true));
        assert_eq!(r.flightrules(), 'I');
        r.waypoints[1].ifr = false;
        assert_eq!(r.flightrules(), 'Y');
        r.waypoints[0].ifr = false;
        assert_eq!(r.flightrules(), 'V');
        r.waypoints[1].ifr = true;
        assert_eq!(r.flightrules(), 'Z');
    }

    #[test]
    fn test_distances() {
        let mut r = FplRoute::new();
        r.waypoints.push(wpt("A", 47.0, 8.0, true));
        r.waypoints.push(wpt("B", 47.0, 9.0, true));
        r.waypoints.push(wpt("C", 46.0, 9.0, true));
        assert!(r.total_distance_nmi() > r.gc_distance_nmi());
    }
}
