//! VFR fallback router.
//!
//! When both endpoints are VFR and no IFR enroute is forced, routing runs
//! over an undirected geometric graph of airports, navaids, intersections
//! and routable map elements. Published VFR arrival/departure routes become
//! the endpoint attachments; edges crossing restricted airspace keep their
//! distance but are penalised a thousandfold, so the cheapest path avoids
//! them whenever any alternative exists.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::config::{ExcludeSpec, RouterConfig};
use crate::fplan::{FplRoute, FplWaypoint, PathCode, WaypointKind};
use crate::geom::{AreaPolygon, Coord, Rect};
use crate::icaofpl::is_ident_numeric;
use crate::navdata::{NavDatabase, VfrPointKind, VfrRoute};

const AVOID_FACTOR: f64 = 1000.0;

#[derive(Debug, Clone)]
struct VfrVertex {
    ident: String,
    name: String,
    coord: Coord,
    kind: WaypointKind,
}

#[derive(Debug, Clone, Copy)]
struct VfrEdge {
    to: usize,
    dist_nmi: f64,
    metric: f64,
}

pub struct VfrRouter<'a> {
    db: &'a dyn NavDatabase,
    cfg: &'a RouterConfig,
    bbox: Rect,
    vertices: Vec<VfrVertex>,
    out: Vec<Vec<VfrEdge>>,
    dep: usize,
    dest: usize,
    sid_routes: Vec<VfrRoute>,
    star_routes: Vec<VfrRoute>,
}

impl<'a> VfrRouter<'a> {
    pub fn new(db: &'a dyn NavDatabase, cfg: &'a RouterConfig) -> Option<Self> {
        let bbox = cfg.bbox()?.oversize_nmi(100.0);
        let mut r = Self {
            db,
            cfg,
            bbox,
            vertices: Vec::new(),
            out: Vec::new(),
            dep: 0,
            dest: 0,
            sid_routes: Vec::new(),
            star_routes: Vec::new(),
        };
        r.load();
        Some(r)
    }

    fn push_vertex(&mut self, v: VfrVertex) -> usize {
        self.vertices.push(v);
        self.out.push(Vec::new());
        self.vertices.len() - 1
    }

    fn load(&mut self) {
        for a in self.db.airports_in(&self.bbox) {
            self.push_vertex(VfrVertex {
                ident: a.icao,
                name: a.name,
                coord: a.coord,
                kind: WaypointKind::Airport,
            });
        }
        for n in self.db.navaids_in(&self.bbox) {
            self.push_vertex(VfrVertex {
                ident: n.ident,
                name: n.name,
                coord: n.coord,
                kind: WaypointKind::Navaid,
            });
        }
        for i in self.db.intersections_in(&self.bbox) {
            self.push_vertex(VfrVertex {
                ident: i.name.clone(),
                name: i.name,
                coord: i.coord,
                kind: WaypointKind::Intersection,
            });
        }
        for m in self.db.mapelements_in(&self.bbox) {
            if !m.kind.is_routable() {
                continue;
            }
            self.push_vertex(VfrVertex {
                ident: m.name.clone(),
                name: m.name,
                coord: m.coord,
                kind: WaypointKind::MapElement,
            });
        }
        debug!(vertices = self.vertices.len(), "VFR area graph loaded");
    }

    fn find_airport(&self, icao: &str, coord: &Coord) -> Option<usize> {
        self.vertices
            .iter()
            .enumerate()
            .find(|(_, v)| {
                v.kind == WaypointKind::Airport
                    && v.ident.eq_ignore_ascii_case(icao)
                    && v.coord.distance_nmi(coord) < 1.0
            })
            .map(|(i, _)| i)
    }

    pub fn set_endpoints(&mut self) -> bool {
        let (Some(dep), Some(dest)) = (&self.cfg.departure, &self.cfg.destination) else {
            return false;
        };
        let dep_idx = match self.find_airport(&dep.icao, &dep.coord) {
            Some(i) => i,
            None => self.push_vertex(VfrVertex {
                ident: dep.icao.clone(),
                name: dep.name.clone(),
                coord: dep.coord,
                kind: WaypointKind::Airport,
            }),
        };
        let dest_idx = match self.find_airport(&dest.icao, &dest.coord) {
            Some(i) => i,
            None => self.push_vertex(VfrVertex {
                ident: dest.icao.clone(),
                name: dest.name.clone(),
                coord: dest.coord,
                kind: WaypointKind::Airport,
            }),
        };
        self.dep = dep_idx;
        self.dest = dest_idx;
        dep_idx != dest_idx
    }

    fn add_undirected(&mut self, u: usize, v: usize, dist: f64) {
        self.out[u].push(VfrEdge {
            to: v,
            dist_nmi: dist,
            metric: dist,
        });
        self.out[v].push(VfrEdge {
            to: u,
            dist_nmi: dist,
            metric: dist,
        });
    }

    /// Attach the published VFR departure routes; true when any were added
    pub fn add_sid(&mut self) -> bool {
        let Some(dep) = self.cfg.departure.clone() else {
            return false;
        };
        let mut added = false;
        for rte in &dep.vfr_routes {
            let Some(last) = rte.points.last() else { continue };
            if last.kind != VfrPointKind::Departure || rte.name.is_empty() {
                continue;
            }
            let v = match self
                .vertices
                .iter()
                .position(|x| x.coord.distance_nmi(&last.coord) < 0.1)
            {
                Some(v) => v,
                None => self.push_vertex(VfrVertex {
                    ident: rte.name.clone(),
                    name: rte.name.clone(),
                    coord: last.coord,
                    kind: WaypointKind::VfrReportingPoint,
                }),
            };
            if !added {
                self.out[self.dep].clear();
            }
            added = true;
            let dist = rte.total_distance_nmi();
            let dep_idx = self.dep;
            self.out[dep_idx].push(VfrEdge {
                to: v,
                dist_nmi: dist,
                metric: dist,
            });
            self.sid_routes.push(rte.clone());
        }
        added
    }

    /// Attach the published VFR arrival routes; true when any were added
    pub fn add_star(&mut self) -> bool {
        let Some(dest) = self.cfg.destination.clone() else {
            return false;
        };
        let mut added = false;
        for rte in &dest.vfr_routes {
            let Some(first) = rte.points.first() else { continue };
            if first.kind != VfrPointKind::Arrival || rte.name.is_empty() {
                continue;
            }
            let v = match self
                .vertices
                .iter()
                .position(|x| x.coord.distance_nmi(&first.coord) < 0.1)
            {
                Some(v) => v,
                None => self.push_vertex(VfrVertex {
                    ident: rte.name.clone(),
                    name: rte.name.clone(),
                    coord: first.coord,
                    kind: WaypointKind::VfrReportingPoint,
                }),
            };
            added = true;
            let dist = rte.total_distance_nmi();
            let dest_idx = self.dest;
            self.out[v].push(VfrEdge {
                to: dest_idx,
                dist_nmi: dist,
                metric: dist,
            });
            self.star_routes.push(rte.clone());
        }
        added
    }

    /// DCT overlay; endpoint limits are suppressed (None) when published
    /// routes already attach that endpoint
    pub fn add_dct(&mut self, dctlim: f64, sidlim: Option<f64>, starlim: Option<f64>) {
        let n = self.vertices.len();
        for u in 0..n {
            if u == self.dest {
                continue;
            }
            let uu = self.vertices[u].clone();
            if uu.kind == WaypointKind::Intersection && is_ident_numeric(&uu.ident) {
                continue;
            }
            if uu.kind == WaypointKind::VfrReportingPoint {
                continue;
            }
            for v in (u + 1)..n {
                if v == self.dep {
                    continue;
                }
                if u == self.dep && v == self.dest {
                    continue;
                }
                let vv = &self.vertices[v];
                if vv.kind == WaypointKind::Intersection && is_ident_numeric(&vv.ident) {
                    continue;
                }
                if vv.kind == WaypointKind::VfrReportingPoint {
                    continue;
                }
                let lim = if u == self.dep {
                    match sidlim {
                        Some(l) => l,
                        None => continue,
                    }
                } else if v == self.dest {
                    match starlim {
                        Some(l) => l,
                        None => continue,
                    }
                } else {
                    dctlim
                };
                let dist = uu.coord.distance_nmi(&vv.coord);
                if dist > lim {
                    continue;
                }
                self.add_undirected(u, v, dist);
            }
        }
        debug!(
            edges = self.out.iter().map(|o| o.len()).sum::<usize>(),
            "VFR area graph after DCT"
        );
    }

    fn penalise_polygon(&mut self, poly: &AreaPolygon, bbox: &Rect) -> usize {
        let dep = self.dep;
        let dest = self.dest;
        let coords: Vec<Coord> = self.vertices.iter().map(|v| v.coord).collect();
        let mut kill = 0;
        for (u, edges) in self.out.iter_mut().enumerate() {
            if u == dep {
                continue;
            }
            for e in edges.iter_mut() {
                if e.to == dest || e.metric > e.dist_nmi {
                    continue;
                }
                if !bbox.intersects_segment(&coords[u], &coords[e.to]) {
                    continue;
                }
                if poly.contains(&coords[u])
                    || poly.contains(&coords[e.to])
                    || poly.intersects_segment(&coords[u], &coords[e.to])
                {
                    e.metric = e.dist_nmi * AVOID_FACTOR;
                    kill += 1;
                }
            }
        }
        kill
    }

    /// Penalise edges through restricted airspaces (classes A-D, P/R/D)
    pub fn exclude_airspace(&mut self, base_level: i32, top_level: i32, max_area_nmi2: f64) {
        if max_area_nmi2 <= 0.0 {
            return;
        }
        let base_ft = base_level * 100;
        let top_ft = top_level * 100;
        for aspc in self.db.airspaces_in(&self.bbox) {
            if !aspc.is_vfr_restricted() {
                continue;
            }
            if base_ft >= aspc.upper_ft || top_ft <= aspc.lower_ft {
                continue;
            }
            if aspc.polygon.area_nmi2() > max_area_nmi2 {
                continue;
            }
            let Some(bbox) = aspc.bbox() else { continue };
            let killed = self.penalise_polygon(&aspc.polygon, &bbox);
            if killed > 0 {
                debug!(
                    airspace = %aspc.icao,
                    class = %aspc.class_string(),
                    killed,
                    "restricted airspace penalised"
                );
            }
        }
    }

    /// Apply the configured exclusion regions
    pub fn exclude_regions(&mut self) {
        let regions = self.cfg.exclude_regions.clone();
        for region in &regions {
            match &region.spec {
                ExcludeSpec::Airspace { id, class } => {
                    let mut found = self.db.airspaces_by_icao(id);
                    found.retain(|a| class.is_empty() || a.class_string() == *class);
                    let Some(aspc) = found.into_iter().next() else {
                        debug!("exclude region: airspace {id}/{class} not found");
                        continue;
                    };
                    let Some(bbox) = aspc.bbox() else { continue };
                    self.penalise_polygon(&aspc.polygon, &bbox);
                }
                ExcludeSpec::Bbox(rect) => {
                    let ring = AreaPolygon::from_ring(vec![
                        rect.southwest(),
                        Coord::new(rect.south, rect.east),
                        rect.northeast(),
                        Coord::new(rect.north, rect.west),
                    ]);
                    self.penalise_polygon(&ring, rect);
                }
            }
        }
    }

    /// Cheapest path as a flight plan skeleton (path codes, coords);
    /// altitudes and timings are bound by the caller.
    pub fn route(&self, cruise_alt_ft: i32) -> Option<FplRoute> {
        if self.dep == self.dest {
            debug!("VFR: departure and destination are the same");
            return None;
        }
        let path = self.dijkstra()?;
        let mut route = FplRoute::new();
        for (i, &v) in path.iter().enumerate() {
            let vv = &self.vertices[v];
            // expand published routes at the endpoints
            if i == 1 && vv.kind == WaypointKind::VfrReportingPoint {
                if let Some(rte) = self
                    .sid_routes
                    .iter()
                    .find(|r| r.name == vv.ident)
                {
                    for pt in rte.points.iter().take(rte.points.len() - 1) {
                        route.waypoints.push(FplWaypoint {
                            name: pt.name.clone(),
                            coord: pt.coord,
                            altitude_ft: pt.altitude_ft,
                            pathcode: PathCode::VfrDeparture,
                            pathname: rte.name.clone(),
                            kind: WaypointKind::VfrReportingPoint,
                            ..FplWaypoint::default()
                        });
                    }
                    continue;
                }
            }
            if i + 1 == path.len() && self.vertices[path[i - 1]].kind
                == WaypointKind::VfrReportingPoint
            {
                let prev = &self.vertices[path[i - 1]];
                if let Some(rte) = self.star_routes.iter().find(|r| r.name == prev.ident) {
                    // drop the reporting-point vertex, splice the route in
                    route.waypoints.pop();
                    for pt in rte.points.iter().take(rte.points.len().saturating_sub(1)) {
                        route.waypoints.push(FplWaypoint {
                            name: pt.name.clone(),
                            coord: pt.coord,
                            altitude_ft: pt.altitude_ft,
                            pathcode: PathCode::VfrArrival,
                            pathname: rte.name.clone(),
                            kind: WaypointKind::VfrReportingPoint,
                            ..FplWaypoint::default()
                        });
                    }
                }
            }
            let is_endpoint = i == 0 || i + 1 == path.len();
            route.waypoints.push(FplWaypoint {
                icao: if vv.kind == WaypointKind::Airport {
                    vv.ident.clone()
                } else {
                    String::new()
                },
                name: if vv.kind == WaypointKind::Airport {
                    vv.name.clone()
                } else {
                    vv.ident.clone()
                },
                coord: vv.coord,
                altitude_ft: if is_endpoint { 0 } else { cruise_alt_ft },
                standard: !is_endpoint,
                pathcode: if i + 1 == path.len() {
                    PathCode::None
                } else {
                    PathCode::DirectTo
                },
                kind: vv.kind,
                ifr: false,
                ..FplWaypoint::default()
            });
        }
        Some(route)
    }

    fn dijkstra(&self) -> Option<Vec<usize>> {
        #[derive(PartialEq)]
        struct Entry(f64, usize);
        impl Eq for Entry {}
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> Ordering {
                other.0.total_cmp(&self.0).then_with(|| other.1.cmp(&self.1))
            }
        }
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        let n = self.vertices.len();
        let mut dist = vec![f64::INFINITY; n];
        let mut prev = vec![usize::MAX; n];
        let mut heap = BinaryHeap::new();
        dist[self.dep] = 0.0;
        heap.push(Entry(0.0, self.dep));
        while let Some(Entry(d, u)) = heap.pop() {
            if d > dist[u] + 1e-9 {
                continue;
            }
            if u == self.dest {
                break;
            }
            for e in &self.out[u] {
                let nd = d + e.metric;
                if nd < dist[e.to] - 1e-9 {
                    dist[e.to] = nd;
                    prev[e.to] = u;
                    heap.push(Entry(nd, e.to));
                }
            }
        }
        if !dist[self.dest].is_finite() {
            debug!(
                sid_edges = self.out[self.dep].len(),
                "VFR: no route found"
            );
            return None;
        }
        let mut path = vec![self.dest];
        let mut v = self.dest;
        while v != self.dep {
            v = prev[v];
            if v == usize::MAX {
                return None;
            }
            path.push(v);
        }
        path.reverse();
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navdata::{
        AirportRecord, AirspaceCategory, AirspaceRecord, FlightRules, MemoryNavDatabase,
        NavaidRecord,
    };

    fn airport(icao: &str, lat: f64, lon: f64) -> AirportRecord {
        AirportRecord {
            icao: icao.into(),
            name: icao.into(),
            coord: Coord::new(lat, lon),
            elevation_ft: 1000,
            flightrules: FlightRules::all(),
            vfr_routes: Vec::new(),
        }
    }

    fn db_with_restricted() -> MemoryNavDatabase {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(airport("LFPN", 48.751667, 2.106111));
        db.airports.push(airport("LFPV", 48.774167, 2.201667));
        // waypoints north and south of the direct line
        db.navaids.push(NavaidRecord {
            ident: "PNORD".into(),
            name: "PNORD".into(),
            coord: Coord::new(48.85, 2.15),
        });
        db.navaids.push(NavaidRecord {
            ident: "PSUD".into(),
            name: "PSUD".into(),
            coord: Coord::new(48.69, 2.15),
        });
        // prohibited area sitting on the direct line
        db.airspaces.push(AirspaceRecord {
            icao: "LFP23".into(),
            name: "PARIS P23".into(),
            class: 'P',
            category: AirspaceCategory::SpecialUse,
            lower_ft: 0,
            upper_ft: 10000,
            polygon: AreaPolygon::from_ring(vec![
                Coord::new(48.74, 2.13),
                Coord::new(48.74, 2.18),
                Coord::new(48.79, 2.18),
                Coord::new(48.79, 2.13),
            ]),
        });
        db
    }

    fn vfr_cfg(db: &MemoryNavDatabase) -> RouterConfig {
        let mut cfg = RouterConfig::default();
        cfg.departure = Some(db.airports[0].clone());
        cfg.destination = Some(db.airports[1].clone());
        cfg.departure_ifr = false;
        cfg.destination_ifr = false;
        cfg.dctlimit_nmi = 50.0;
        cfg.vfr_airspace_limit_nmi2 = 1000.0;
        cfg
    }

    #[test]
    fn test_route_avoids_prohibited_area() {
        let db = db_with_restricted();
        let cfg = vfr_cfg(&db);
        let mut r = VfrRouter::new(&db, &cfg).unwrap();
        assert!(r.set_endpoints());
        r.add_dct(50.0, Some(50.0), Some(50.0));
        r.exclude_airspace(cfg.base_level, cfg.top_level, cfg.vfr_airspace_limit_nmi2);
        let route = r.route(5500).expect("route");
        assert!(route.len() >= 3, "route must detour: {:?}", route.waypoints);
        let poly = &db.airspaces[0].polygon;
        for w in route.waypoints.windows(2) {
            assert!(
                !poly.intersects_segment(&w[0].coord, &w[1].coord),
                "leg {}-{} crosses P area",
                w[0].name,
                w[1].name
            );
        }
    }

    #[test]
    fn test_same_endpoints_fail() {
        let mut db = db_with_restricted();
        db.airports[1] = db.airports[0].clone();
        let cfg = vfr_cfg(&db);
        let mut r = VfrRouter::new(&db, &cfg).unwrap();
        assert!(!r.set_endpoints());
    }

    #[test]
    fn test_waypoints_are_vfr() {
        let db = db_with_restricted();
        let cfg = vfr_cfg(&db);
        let mut r = VfrRouter::new(&db, &cfg).unwrap();
        assert!(r.set_endpoints());
        r.add_dct(50.0, Some(50.0), Some(50.0));
        let route = r.route(5500).expect("route");
        assert!(route.waypoints.iter().all(|w| !w.ifr));
        assert_eq!(route.flightrules(), 'V');
    }
}
