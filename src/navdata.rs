//! Aeronautical database interface and record types.
//!
//! The routing engine consumes read-only lookups through the [`NavDatabase`]
//! trait; the bundled [`MemoryNavDatabase`] keeps everything in memory and can
//! be populated from a data directory (CSV for point/airway tables, JSON for
//! airspaces and procedures) or programmatically for tests.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::geom::{AreaPolygon, Coord, Rect};

/// Flight-rules capability flags of an aerodrome
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlightRules {
    pub dep_ifr: bool,
    pub dep_vfr: bool,
    pub arr_ifr: bool,
    pub arr_vfr: bool,
}

impl FlightRules {
    pub fn all() -> Self {
        Self {
            dep_ifr: true,
            dep_vfr: true,
            arr_ifr: true,
            arr_vfr: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfrPointKind {
    Arrival,
    Departure,
    Holding,
    Other,
}

/// One point of a published VFR arrival/departure route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfrRoutePoint {
    pub name: String,
    pub coord: Coord,
    pub altitude_ft: i32,
    pub kind: VfrPointKind,
    #[serde(default)]
    pub at_airport: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfrRoute {
    pub name: String,
    pub points: Vec<VfrRoutePoint>,
}

impl VfrRoute {
    pub fn total_distance_nmi(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].coord.distance_nmi(&w[1].coord))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirportRecord {
    pub icao: String,
    pub name: String,
    pub coord: Coord,
    pub elevation_ft: i32,
    #[serde(default)]
    pub flightrules: FlightRules,
    #[serde(default)]
    pub vfr_routes: Vec<VfrRoute>,
}

impl AirportRecord {
    pub fn icao_name(&self) -> String {
        if self.name.is_empty() {
            self.icao.clone()
        } else {
            format!("{} {}", self.icao, self.name)
        }
    }

    /// Aerodromes without a published ICAO locator file as ZZZZ
    pub fn is_fpl_zzzz(&self) -> bool {
        self.icao.len() != 4 || !self.icao.chars().all(|c| c.is_ascii_alphabetic())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavaidRecord {
    pub ident: String,
    pub name: String,
    pub coord: Coord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntersectionRecord {
    pub name: String,
    pub coord: Coord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapElementKind {
    City,
    Village,
    Spot,
    Landmark,
    Lake,
    Other,
}

impl MapElementKind {
    /// Kinds usable as VFR routing points
    pub fn is_routable(&self) -> bool {
        !matches!(self, MapElementKind::Other)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapElementRecord {
    pub name: String,
    pub coord: Coord,
    pub kind: MapElementKind,
}

/// One directed leg of a published airway, with its vertical band in levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirwaySegment {
    pub airway: String,
    pub from_ident: String,
    pub from_coord: Coord,
    pub to_ident: String,
    pub to_coord: Coord,
    pub base_fl: i32,
    pub top_fl: i32,
}

/// Airspace categories relevant to routing exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AirspaceCategory {
    ClassAirspace,
    SpecialUse,
    Ead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirspaceRecord {
    pub icao: String,
    pub name: String,
    /// Class or boundary letter: A-G for class airspaces, P/R/D for special use
    pub class: char,
    pub category: AirspaceCategory,
    pub lower_ft: i32,
    pub upper_ft: i32,
    pub polygon: AreaPolygon,
}

impl AirspaceRecord {
    pub fn class_string(&self) -> String {
        self.class.to_string()
    }

    pub fn bbox(&self) -> Option<Rect> {
        self.polygon.bbox()
    }

    /// Classes the VFR router must keep clear of
    pub fn is_vfr_restricted(&self) -> bool {
        match self.category {
            AirspaceCategory::ClassAirspace => ('A'..='D').contains(&self.class),
            AirspaceCategory::SpecialUse | AirspaceCategory::Ead => {
                matches!(self.class, 'P' | 'R' | 'D')
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Sid,
    Star,
}

/// A SID or STAR tying an aerodrome to its enroute terminal fix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub airport_icao: String,
    pub name: String,
    pub kind: ProcedureKind,
    pub terminal_ident: String,
    pub terminal_coord: Coord,
    /// Track distance flown along the procedure, nmi
    pub track_nmi: f64,
}

/// Synchronous read-only lookups into the aeronautical database
pub trait NavDatabase: Send + Sync {
    fn airports_by_icao(&self, icao: &str, exact: bool) -> Vec<AirportRecord>;
    fn airports_by_name(&self, name: &str, exact: bool) -> Vec<AirportRecord>;
    fn airports_in(&self, rect: &Rect) -> Vec<AirportRecord>;
    fn navaids_by_ident(&self, ident: &str, exact: bool) -> Vec<NavaidRecord>;
    fn navaids_in(&self, rect: &Rect) -> Vec<NavaidRecord>;
    fn intersections_by_name(&self, name: &str, exact: bool) -> Vec<IntersectionRecord>;
    fn intersections_in(&self, rect: &Rect) -> Vec<IntersectionRecord>;
    fn mapelements_by_name(&self, name: &str, exact: bool) -> Vec<MapElementRecord>;
    fn mapelements_in(&self, rect: &Rect) -> Vec<MapElementRecord>;
    fn airways_in(&self, rect: &Rect) -> Vec<AirwaySegment>;
    fn airspaces_in(&self, rect: &Rect) -> Vec<AirspaceRecord>;
    fn airspaces_by_icao(&self, icao: &str) -> Vec<AirspaceRecord>;
    fn procedures_for(&self, airport_icao: &str, kind: ProcedureKind) -> Vec<ProcedureRecord>;
}

fn text_match(candidate: &str, query: &str, exact: bool) -> bool {
    let c = candidate.to_ascii_uppercase();
    let q = query.to_ascii_uppercase();
    if exact { c == q } else { c.contains(&q) }
}

/// In-memory database backend
#[derive(Debug, Default, Clone)]
pub struct MemoryNavDatabase {
    pub airports: Vec<AirportRecord>,
    pub navaids: Vec<NavaidRecord>,
    pub intersections: Vec<IntersectionRecord>,
    pub mapelements: Vec<MapElementRecord>,
    pub airways: Vec<AirwaySegment>,
    pub airspaces: Vec<AirspaceRecord>,
    pub procedures: Vec<ProcedureRecord>,
}

#[derive(Debug, Deserialize)]
struct AirportRow {
    icao: String,
    name: String,
    lat: f64,
    lon: f64,
    elevation_ft: i32,
    #[serde(default)]
    dep_ifr: Option<u8>,
    #[serde(default)]
    arr_ifr: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct NavaidRow {
    ident: String,
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct IntersectionRow {
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct AirwayRow {
    airway: String,
    from_ident: String,
    from_lat: f64,
    from_lon: f64,
    to_ident: String,
    to_lat: f64,
    to_lon: f64,
    base_fl: i32,
    top_fl: i32,
}

impl MemoryNavDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a database directory. Missing files disable the dependent
    /// functionality instead of failing the whole load.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut db = Self::new();
        db.load_airports(&dir.join("airports.csv"));
        db.load_navaids(&dir.join("navaids.csv"));
        db.load_intersections(&dir.join("intersections.csv"));
        db.load_airways(&dir.join("airways.csv"));
        db.load_airspaces(&dir.join("airspaces.json"));
        db.load_procedures(&dir.join("procedures.json"));
        if db.airports.is_empty() {
            warn!("No airports loaded from {}", dir.display());
        }
        info!(
            "Loaded navdata from {}: {} airports, {} navaids, {} intersections, {} airway segments, {} airspaces, {} procedures",
            dir.display(),
            db.airports.len(),
            db.navaids.len(),
            db.intersections.len(),
            db.airways.len(),
            db.airspaces.len(),
            db.procedures.len()
        );
        Ok(db)
    }

    fn load_airports(&mut self, path: &Path) {
        match read_csv::<AirportRow>(path) {
            Ok(rows) => {
                self.airports = rows
                    .into_iter()
                    .map(|r| AirportRecord {
                        icao: r.icao,
                        name: r.name,
                        coord: Coord::new(r.lat, r.lon),
                        elevation_ft: r.elevation_ft,
                        flightrules: FlightRules {
                            dep_ifr: r.dep_ifr.unwrap_or(1) != 0,
                            dep_vfr: true,
                            arr_ifr: r.arr_ifr.unwrap_or(1) != 0,
                            arr_vfr: true,
                        },
                        vfr_routes: Vec::new(),
                    })
                    .collect();
            }
            Err(e) => warn!("Airport table unavailable ({}): {e}", path.display()),
        }
    }

    fn load_navaids(&mut self, path: &Path) {
        match read_csv::<NavaidRow>(path) {
            Ok(rows) => {
                self.navaids = rows
                    .into_iter()
                    .map(|r| NavaidRecord {
                        ident: r.ident,
                        name: r.name,
                        coord: Coord::new(r.lat, r.lon),
                    })
                    .collect();
            }
            Err(e) => warn!("Navaid table unavailable ({}): {e}", path.display()),
        }
    }

    fn load_intersections(&mut self, path: &Path) {
        match read_csv::<IntersectionRow>(path) {
            Ok(rows) => {
                self.intersections = rows
                    .into_iter()
                    .map(|r| IntersectionRecord {
                        name: r.name,
                        coord: Coord::new(r.lat, r.lon),
                    })
                    .collect();
            }
            Err(e) => warn!("Intersection table unavailable ({}): {e}", path.display()),
        }
    }

    fn load_airways(&mut self, path: &Path) {
        match read_csv::<AirwayRow>(path) {
            Ok(rows) => {
                self.airways = rows
                    .into_iter()
                    .map(|r| AirwaySegment {
                        airway: r.airway,
                        from_ident: r.from_ident,
                        from_coord: Coord::new(r.from_lat, r.from_lon),
                        to_ident: r.to_ident,
                        to_coord: Coord::new(r.to_lat, r.to_lon),
                        base_fl: r.base_fl,
                        top_fl: r.top_fl,
                    })
                    .collect();
            }
            Err(e) => warn!("Airway table unavailable ({}): {e}", path.display()),
        }
    }

    fn load_airspaces(&mut self, path: &Path) {
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<Vec<AirspaceRecord>>(&s).map_err(Into::into))
        {
            Ok(recs) => self.airspaces = recs,
            Err(e) => warn!("Airspace table unavailable ({}): {e}", path.display()),
        }
    }

    fn load_procedures(&mut self, path: &Path) {
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<Vec<ProcedureRecord>>(&s).map_err(Into::into))
        {
            Ok(recs) => self.procedures = recs,
            Err(e) => warn!("Procedure table unavailable ({}): {e}", path.display()),
        }
    }
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for rec in rdr.deserialize() {
        out.push(rec.with_context(|| format!("Malformed row in {}", path.display()))?);
    }
    Ok(out)
}

impl NavDatabase for MemoryNavDatabase {
    fn airports_by_icao(&self, icao: &str, exact: bool) -> Vec<AirportRecord> {
        self.airports
            .iter()
            .filter(|a| text_match(&a.icao, icao, exact))
            .cloned()
            .collect()
    }

    fn airports_by_name(&self, name: &str, exact: bool) -> Vec<AirportRecord> {
        self.airports
            .iter()
            .filter(|a| text_match(&a.name, name, exact))
            .cloned()
            .collect()
    }

    fn airports_in(&self, rect: &Rect) -> Vec<AirportRecord> {
        self.airports
            .iter()
            .filter(|a| rect.contains(&a.coord))
            .cloned()
            .collect()
    }

    fn navaids_by_ident(&self, ident: &str, exact: bool) -> Vec<NavaidRecord> {
        self.navaids
            .iter()
            .filter(|n| text_match(&n.ident, ident, exact) || text_match(&n.name, ident, exact))
            .cloned()
            .collect()
    }

    fn navaids_in(&self, rect: &Rect) -> Vec<NavaidRecord> {
        self.navaids
            .iter()
            .filter(|n| rect.contains(&n.coord))
            .cloned()
            .collect()
    }

    fn intersections_by_name(&self, name: &str, exact: bool) -> Vec<IntersectionRecord> {
        self.intersections
            .iter()
            .filter(|i| text_match(&i.name, name, exact))
            .cloned()
            .collect()
    }

    fn intersections_in(&self, rect: &Rect) -> Vec<IntersectionRecord> {
        self.intersections
            .iter()
            .filter(|i| rect.contains(&i.coord))
            .cloned()
            .collect()
    }

    fn mapelements_by_name(&self, name: &str, exact: bool) -> Vec<MapElementRecord> {
        self.mapelements
            .iter()
            .filter(|m| text_match(&m.name, name, exact))
            .cloned()
            .collect()
    }

    fn mapelements_in(&self, rect: &Rect) -> Vec<MapElementRecord> {
        self.mapelements
            .iter()
            .filter(|m| rect.contains(&m.coord))
            .cloned()
            .collect()
    }

    fn airways_in(&self, rect: &Rect) -> Vec<AirwaySegment> {
        self.airways
            .iter()
            .filter(|s| rect.contains(&s.from_coord) || rect.contains(&s.to_coord))
            .cloned()
            .collect()
    }

    fn airspaces_in(&self, rect: &Rect) -> Vec<AirspaceRecord> {
        self.airspaces
            .iter()
            .filter(|a| a.bbox().map(|b| b.intersects(rect)).unwrap_or(false))
            .cloned()
            .collect()
    }

    fn airspaces_by_icao(&self, icao: &str) -> Vec<AirspaceRecord> {
        self.airspaces
            .iter()
            .filter(|a| a.icao.eq_ignore_ascii_case(icao))
            .cloned()
            .collect()
    }

    fn procedures_for(&self, airport_icao: &str, kind: ProcedureKind) -> Vec<ProcedureRecord> {
        self.procedures
            .iter()
            .filter(|p| p.kind == kind && p.airport_icao.eq_ignore_ascii_case(airport_icao))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> MemoryNavDatabase {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(AirportRecord {
            icao: "LSZH".into(),
            name: "ZURICH".into(),
            coord: Coord::new(47.458056, 8.548056),
            elevation_ft: 1417,
            flightrules: FlightRules::all(),
            vfr_routes: Vec::new(),
        });
        db.navaids.push(NavaidRecord {
            ident: "TRA".into(),
            name: "TRASADINGEN".into(),
            coord: Coord::new(47.689444, 8.437222),
        });
        db
    }

    #[test]
    fn test_icao_lookup_case_insensitive() {
        let db = sample_db();
        assert_eq!(db.airports_by_icao("lszh", true).len(), 1);
        assert_eq!(db.airports_by_icao("LSZ", false).len(), 1);
        assert!(db.airports_by_icao("LSZ", true).is_empty());
    }

    #[test]
    fn test_navaid_lookup_by_name() {
        let db = sample_db();
        assert_eq!(db.navaids_by_ident("TRASADINGEN", true).len(), 1);
        assert_eq!(db.navaids_by_ident("TRA", true).len(), 1);
    }

    #[test]
    fn test_rect_lookup() {
        let db = sample_db();
        let rect = Rect::new(Coord::new(47.0, 8.0), Coord::new(48.0, 9.0));
        assert_eq!(db.airports_in(&rect).len(), 1);
        assert_eq!(db.navaids_in(&rect).len(), 1);
        let far = Rect::new(Coord::new(50.0, 0.0), Coord::new(51.0, 1.0));
        assert!(db.airports_in(&far).is_empty());
    }

    #[test]
    fn test_zzzz_detection() {
        let mut a = sample_db().airports[0].clone();
        assert!(!a.is_fpl_zzzz());
        a.icao = "ZH2".into();
        assert!(a.is_fpl_zzzz());
    }
}
