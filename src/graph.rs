//! Annotated airway / direct-routing graph.
//!
//! Directed multigraph over airspace fixes and procedure endpoints. Vertices
//! live in a flat vector; edges hang off their source vertex in out-edge
//! lists, so parallel edges (an airway plus a DCT overlay between the same
//! fixes) coexist and are told apart by identifier. Every edge carries the
//! flight-level band in which it may be flown.
//!
//! Construction follows a fixed pipeline: load vertices, attach procedures,
//! overlay airways, overlay DCT candidates, apply exclusions, precompute
//! crossing zones. The diagnostic mapper mutates the result between solver
//! runs; edges are only ever removed or penalised, never added back.

use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ExcludeSpec, RouterConfig};
use crate::fplan::WaypointKind;
use crate::geom::{Coord, Rect};
use crate::icaofpl::is_ident_numeric;
use crate::navdata::{NavDatabase, ProcedureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Airway,
    DirectTo,
    Sid,
    Star,
    Anchor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vertex {
    pub ident: String,
    pub name: String,
    pub coord: Coord,
    pub kind: WaypointKind,
    pub elevation_ft: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub to: usize,
    pub ident: String,
    pub lower_fl: i32,
    pub upper_fl: i32,
    pub kind: EdgeKind,
    pub dist_nmi: f64,
    /// Effective distance including penalty factors and offsets; what the
    /// solver multiplies by the per-level metric.
    pub metric: f64,
}

impl Edge {
    pub fn permits_level(&self, fl: i32) -> bool {
        fl >= self.lower_fl && fl <= self.upper_fl
    }
}

/// Vertices satisfying one crossing constraint
#[derive(Debug, Clone, Default)]
pub struct CrossingZone {
    pub center: Coord,
    pub radius_nmi: f64,
    pub minlevel: i32,
    pub maxlevel: i32,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteGraph {
    pub vertices: Vec<Vertex>,
    out: Vec<Vec<Edge>>,
    pub dep: usize,
    pub dest: usize,
    pub crossings: Vec<CrossingZone>,
    pub bbox: Rect,
}

/// Everything the construction pipeline needs
pub struct GraphBuild<'a> {
    pub cfg: &'a RouterConfig,
    pub db: &'a dyn NavDatabase,
    /// Upper level cap: min(top level, aircraft ceiling)
    pub top_fl_cap: i32,
    /// Precomputed tile supplying the airway overlay instead of the database
    pub tile: Option<&'a crate::precomp::GraphTile>,
}

impl RouteGraph {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.out.iter().map(|v| v.len()).sum()
    }

    pub fn out_edges(&self, u: usize) -> &[Edge] {
        &self.out[u]
    }

    /// Append an edge, growing the adjacency to cover all vertices
    pub fn push_edge(&mut self, u: usize, e: Edge) {
        if self.out.len() < self.vertices.len() {
            self.out.resize_with(self.vertices.len(), Vec::new);
        }
        self.out[u].push(e);
    }

    pub fn for_each_edge_mut(&mut self, mut f: impl FnMut(usize, &mut Edge)) {
        for (u, edges) in self.out.iter_mut().enumerate() {
            for e in edges.iter_mut() {
                f(u, e);
            }
        }
    }

    /// Does any edge end at the vertex
    pub fn has_in_edges(&self, v: usize) -> bool {
        self.out.iter().any(|edges| edges.iter().any(|e| e.to == v))
    }

    pub fn vertex(&self, u: usize) -> &Vertex {
        &self.vertices[u]
    }

    /// Nearest vertex with the given ident (case-insensitive)
    pub fn find_by_ident(&self, ident: &str, near: &Coord) -> Option<usize> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.ident.eq_ignore_ascii_case(ident))
            .min_by(|(_, a), (_, b)| {
                a.coord
                    .distance_nmi(near)
                    .total_cmp(&b.coord.distance_nmi(near))
            })
            .map(|(i, _)| i)
    }

    pub fn find_nearest(&self, pt: &Coord, max_dist_nmi: f64) -> Option<usize> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (i, v.coord.distance_nmi(pt)))
            .filter(|(_, d)| *d <= max_dist_nmi)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Build the full graph per the configured pipeline
    pub fn build(b: &GraphBuild) -> Result<RouteGraph> {
        let (Some(dep), Some(dest)) = (&b.cfg.departure, &b.cfg.destination) else {
            bail!("departure and destination must be set before graph construction");
        };
        let bbox = b
            .cfg
            .bbox()
            .expect("bbox exists when endpoints are set")
            .oversize_nmi(100.0);
        let mut g = RouteGraph {
            bbox,
            ..RouteGraph::default()
        };
        let mut index: HashMap<(String, i64, i64), usize> = HashMap::new();

        let mut add_vertex = |g: &mut RouteGraph,
                              index: &mut HashMap<(String, i64, i64), usize>,
                              v: Vertex|
         -> usize {
            let key = (
                v.ident.to_ascii_uppercase(),
                (v.coord.lat * 10000.0).round() as i64,
                (v.coord.lon * 10000.0).round() as i64,
            );
            *index.entry(key).or_insert_with(|| {
                g.vertices.push(v);
                g.out.push(Vec::new());
                g.vertices.len() - 1
            })
        };

        // 1: vertices in the oversized bounding box
        for a in b.db.airports_in(&bbox) {
            add_vertex(
                &mut g,
                &mut index,
                Vertex {
                    ident: a.icao.clone(),
                    name: a.name.clone(),
                    coord: a.coord,
                    kind: WaypointKind::Airport,
                    elevation_ft: a.elevation_ft,
                },
            );
        }
        for n in b.db.navaids_in(&bbox) {
            add_vertex(
                &mut g,
                &mut index,
                Vertex {
                    ident: n.ident.clone(),
                    name: n.name.clone(),
                    coord: n.coord,
                    kind: WaypointKind::Navaid,
                    elevation_ft: 0,
                },
            );
        }
        for i in b.db.intersections_in(&bbox) {
            add_vertex(
                &mut g,
                &mut index,
                Vertex {
                    ident: i.name.clone(),
                    name: i.name.clone(),
                    coord: i.coord,
                    kind: WaypointKind::Intersection,
                    elevation_ft: 0,
                },
            );
        }
        g.dep = add_vertex(
            &mut g,
            &mut index,
            Vertex {
                ident: dep.icao.clone(),
                name: dep.name.clone(),
                coord: dep.coord,
                kind: WaypointKind::Airport,
                elevation_ft: dep.elevation_ft,
            },
        );
        g.dest = add_vertex(
            &mut g,
            &mut index,
            Vertex {
                ident: dest.icao.clone(),
                name: dest.name.clone(),
                coord: dest.coord,
                kind: WaypointKind::Airport,
                elevation_ft: dest.elevation_ft,
            },
        );
        debug!(vertices = g.vertex_count(), "graph vertices loaded");

        // 2: procedure edges
        let use_sid_db = b.cfg.sid.use_db || b.cfg.sid.coord.is_none();
        if use_sid_db {
            for proc in b.db.procedures_for(&dep.icao, ProcedureKind::Sid) {
                if !b.cfg.sid.allows_procedure(&proc.name) {
                    continue;
                }
                let term = g
                    .find_by_ident(&proc.terminal_ident, &proc.terminal_coord)
                    .unwrap_or_else(|| {
                        add_vertex(
                            &mut g,
                            &mut index,
                            Vertex {
                                ident: proc.terminal_ident.clone(),
                                name: proc.terminal_ident.clone(),
                                coord: proc.terminal_coord,
                                kind: WaypointKind::ProcedureAnchor,
                                elevation_ft: 0,
                            },
                        )
                    });
                if term == g.dest {
                    continue;
                }
                let dist = proc.track_nmi.max(dep.coord.distance_nmi(&proc.terminal_coord));
                let metric = dist * b.cfg.sid.penalty + b.cfg.sid.offset_nmi;
                g.out[g.dep].push(Edge {
                    to: term,
                    ident: proc.name.clone(),
                    lower_fl: 0,
                    upper_fl: 600,
                    kind: EdgeKind::Sid,
                    dist_nmi: dist,
                    metric,
                });
            }
        }
        if let Some(anchor) = b.cfg.sid.coord {
            let term = g.find_nearest(&anchor, 0.1).unwrap_or_else(|| {
                add_vertex(
                    &mut g,
                    &mut index,
                    Vertex {
                        ident: b.cfg.sid.ident.clone(),
                        name: b.cfg.sid.ident.clone(),
                        coord: anchor,
                        kind: WaypointKind::ProcedureAnchor,
                        elevation_ft: 0,
                    },
                )
            });
            if term != g.dest {
                let dist = dep
                    .coord
                    .distance_nmi(&anchor)
                    .max(b.cfg.sid.minimum_nmi);
                g.out[g.dep].push(Edge {
                    to: term,
                    ident: b.cfg.sid.ident.clone(),
                    lower_fl: 0,
                    upper_fl: 600,
                    kind: EdgeKind::Anchor,
                    dist_nmi: dist,
                    metric: dist * b.cfg.sid.penalty + b.cfg.sid.offset_nmi,
                });
            }
        }
        let use_star_db = b.cfg.star.use_db || b.cfg.star.coord.is_none();
        if use_star_db {
            for proc in b.db.procedures_for(&dest.icao, ProcedureKind::Star) {
                if !b.cfg.star.allows_procedure(&proc.name) {
                    continue;
                }
                let entry = g
                    .find_by_ident(&proc.terminal_ident, &proc.terminal_coord)
                    .unwrap_or_else(|| {
                        add_vertex(
                            &mut g,
                            &mut index,
                            Vertex {
                                ident: proc.terminal_ident.clone(),
                                name: proc.terminal_ident.clone(),
                                coord: proc.terminal_coord,
                                kind: WaypointKind::ProcedureAnchor,
                                elevation_ft: 0,
                            },
                        )
                    });
                if entry == g.dep {
                    continue;
                }
                let dist = proc
                    .track_nmi
                    .max(dest.coord.distance_nmi(&proc.terminal_coord));
                let metric = dist * b.cfg.star.penalty + b.cfg.star.offset_nmi;
                g.out[entry].push(Edge {
                    to: g.dest,
                    ident: proc.name.clone(),
                    lower_fl: 0,
                    upper_fl: 600,
                    kind: EdgeKind::Star,
                    dist_nmi: dist,
                    metric,
                });
            }
        }
        if let Some(anchor) = b.cfg.star.coord {
            let entry = g.find_nearest(&anchor, 0.1).unwrap_or_else(|| {
                add_vertex(
                    &mut g,
                    &mut index,
                    Vertex {
                        ident: b.cfg.star.ident.clone(),
                        name: b.cfg.star.ident.clone(),
                        coord: anchor,
                        kind: WaypointKind::ProcedureAnchor,
                        elevation_ft: 0,
                    },
                )
            });
            if entry != g.dep {
                let dist = dest
                    .coord
                    .distance_nmi(&anchor)
                    .max(b.cfg.star.minimum_nmi);
                g.out[entry].push(Edge {
                    to: g.dest,
                    ident: b.cfg.star.ident.clone(),
                    lower_fl: 0,
                    upper_fl: 600,
                    kind: EdgeKind::Anchor,
                    dist_nmi: dist,
                    metric: dist * b.cfg.star.penalty + b.cfg.star.offset_nmi,
                });
            }
        }

        // 3: airway overlay, both directions
        if let Some(tile) = b.tile {
            let mut remap = Vec::with_capacity(tile.vertices.len());
            for v in &tile.vertices {
                remap.push(add_vertex(&mut g, &mut index, v.clone()));
            }
            for (from, e) in &tile.edges {
                let (Some(&u), Some(&v)) = (remap.get(*from as usize), remap.get(e.to)) else {
                    continue;
                };
                let lower = e.lower_fl.max(0);
                let upper = e.upper_fl.min(b.top_fl_cap);
                if lower > upper {
                    continue;
                }
                g.out[u].push(Edge {
                    to: v,
                    lower_fl: lower,
                    upper_fl: upper,
                    ..e.clone()
                });
            }
        }
        let airway_segs = if b.tile.is_none() {
            b.db.airways_in(&bbox)
        } else {
            Vec::new()
        };
        for seg in airway_segs {
            let lower = seg.base_fl.max(0);
            let upper = seg.top_fl.min(b.top_fl_cap);
            if lower > upper {
                continue;
            }
            let u = g
                .find_by_ident(&seg.from_ident, &seg.from_coord)
                .unwrap_or_else(|| {
                    add_vertex(
                        &mut g,
                        &mut index,
                        Vertex {
                            ident: seg.from_ident.clone(),
                            name: seg.from_ident.clone(),
                            coord: seg.from_coord,
                            kind: WaypointKind::Intersection,
                            elevation_ft: 0,
                        },
                    )
                });
            let v = g
                .find_by_ident(&seg.to_ident, &seg.to_coord)
                .unwrap_or_else(|| {
                    add_vertex(
                        &mut g,
                        &mut index,
                        Vertex {
                            ident: seg.to_ident.clone(),
                            name: seg.to_ident.clone(),
                            coord: seg.to_coord,
                            kind: WaypointKind::Intersection,
                            elevation_ft: 0,
                        },
                    )
                });
            if u == v {
                continue;
            }
            let dist = seg.from_coord.distance_nmi(&seg.to_coord);
            for (a, bb) in [(u, v), (v, u)] {
                g.out[a].push(Edge {
                    to: bb,
                    ident: seg.airway.clone(),
                    lower_fl: lower,
                    upper_fl: upper,
                    kind: EdgeKind::Airway,
                    dist_nmi: dist,
                    metric: dist,
                });
            }
        }

        // 4: DCT overlay
        g.add_dct(
            b.cfg.dctlimit_nmi,
            b.cfg.dctpenalty,
            b.cfg.dctoffset,
            if b.cfg.sid.proc_only {
                0.0
            } else {
                b.cfg.sid.limit_nmi
            },
            if b.cfg.star.proc_only {
                0.0
            } else {
                b.cfg.star.limit_nmi
            },
            b.top_fl_cap,
        );

        // 5: exclusions
        g.apply_exclusions(b.cfg, b.db);

        // 6: crossing zones
        for c in &b.cfg.crossings {
            let Some(center) = c.coord else { continue };
            let radius = c.radius_nmi.max(0.1);
            let members = g
                .vertices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.coord.distance_nmi(&center) <= radius)
                .map(|(i, _)| i)
                .collect();
            g.crossings.push(CrossingZone {
                center,
                radius_nmi: radius,
                minlevel: c.minlevel,
                maxlevel: c.maxlevel,
                members,
            });
        }

        info!(
            vertices = g.vertex_count(),
            edges = g.edge_count(),
            crossings = g.crossings.len(),
            "routing graph built"
        );
        metrics::gauge!("graph.vertices").set(g.vertex_count() as f64);
        metrics::gauge!("graph.edges").set(g.edge_count() as f64);
        Ok(g)
    }

    /// DCT candidate overlay. Numeric intersection names never become DCT
    /// endpoints, and no DCT connects dep directly to dest.
    fn add_dct(
        &mut self,
        dctlimit: f64,
        penalty: f64,
        offset: f64,
        sidlimit: f64,
        starlimit: f64,
        top_fl_cap: i32,
    ) {
        let n = self.vertices.len();
        for u in 0..n {
            let uu = &self.vertices[u];
            if u != self.dep
                && uu.kind == WaypointKind::Intersection
                && is_ident_numeric(&uu.ident)
            {
                continue;
            }
            // airports other than the endpoints do not participate in DCT
            if uu.kind == WaypointKind::Airport && u != self.dep {
                continue;
            }
            if u == self.dest {
                continue;
            }
            let mut new_edges = Vec::new();
            for v in 0..n {
                if u == v || v == self.dep {
                    continue;
                }
                let vv = &self.vertices[v];
                if u == self.dep && v == self.dest {
                    continue;
                }
                if v != self.dest
                    && vv.kind == WaypointKind::Intersection
                    && is_ident_numeric(&vv.ident)
                {
                    continue;
                }
                if vv.kind == WaypointKind::Airport && v != self.dest {
                    continue;
                }
                let lim = if u == self.dep {
                    sidlimit
                } else if v == self.dest {
                    starlimit
                } else {
                    dctlimit
                };
                if lim <= 0.0 {
                    continue;
                }
                let dist = self.vertices[u].coord.distance_nmi(&vv.coord);
                if dist > lim {
                    continue;
                }
                let kind = if u == self.dep {
                    EdgeKind::Sid
                } else if v == self.dest {
                    EdgeKind::Star
                } else {
                    EdgeKind::DirectTo
                };
                new_edges.push(Edge {
                    to: v,
                    ident: String::new(),
                    lower_fl: 0,
                    upper_fl: top_fl_cap,
                    kind,
                    dist_nmi: dist,
                    metric: dist * penalty + offset,
                });
            }
            self.out[u].extend(new_edges);
        }
    }

    /// Apply the configured exclusion regions
    fn apply_exclusions(&mut self, cfg: &RouterConfig, db: &dyn NavDatabase) {
        for region in &cfg.exclude_regions {
            let (polygon, bbox) = match &region.spec {
                ExcludeSpec::Airspace { id, class } => {
                    let mut found = db.airspaces_by_icao(id);
                    found.retain(|a| class.is_empty() || a.class_string() == *class);
                    let Some(aspc) = found.into_iter().next() else {
                        debug!("exclude region: airspace {id}/{class} not found");
                        continue;
                    };
                    let bbox = aspc.bbox().unwrap_or(self.bbox);
                    (Some(aspc.polygon), bbox)
                }
                ExcludeSpec::Bbox(rect) => (None, *rect),
            };
            let dep = self.dep;
            let dest = self.dest;
            let vertices = std::mem::take(&mut self.vertices);
            let mut removed = 0usize;
            let mut scaled = 0usize;
            for (u, edges) in self.out.iter_mut().enumerate() {
                if u == dep {
                    continue;
                }
                let ucoord = vertices[u].coord;
                edges.retain_mut(|e| {
                    if e.to == dest {
                        return true;
                    }
                    let vcoord = vertices[e.to].coord;
                    let crosses = match &polygon {
                        Some(poly) => {
                            bbox.intersects_segment(&ucoord, &vcoord)
                                && (poly.contains(&ucoord)
                                    || poly.contains(&vcoord)
                                    || poly.intersects_segment(&ucoord, &vcoord))
                        }
                        None => {
                            bbox.contains(&ucoord)
                                || bbox.contains(&vcoord)
                                || bbox.intersects_segment(&ucoord, &vcoord)
                        }
                    };
                    if !crosses {
                        return true;
                    }
                    match e.kind {
                        EdgeKind::Airway => {
                            if e.dist_nmi <= region.awylimit_nmi {
                                return true;
                            }
                            match subtract_band(
                                (e.lower_fl, e.upper_fl),
                                (region.minlevel, region.maxlevel),
                            ) {
                                Some((lo, hi)) => {
                                    e.lower_fl = lo;
                                    e.upper_fl = hi;
                                    true
                                }
                                None => {
                                    removed += 1;
                                    false
                                }
                            }
                        }
                        EdgeKind::DirectTo => {
                            if region.dctlimit_nmi > 0.0 && e.dist_nmi > region.dctlimit_nmi {
                                removed += 1;
                                return false;
                            }
                            e.metric = e.metric * region.dctscale + region.dctoffset;
                            scaled += 1;
                            true
                        }
                        _ => true,
                    }
                });
            }
            self.vertices = vertices;
            debug!(removed, scaled, "exclusion region applied");
        }
    }

    // ---- mutators driven by the diagnostic mapper ----

    /// Remove SID edges carrying the given procedure name
    pub fn remove_sid_named(&mut self, name: &str) -> usize {
        let before = self.out[self.dep].len();
        self.out[self.dep]
            .retain(|e| !(e.kind == EdgeKind::Sid && e.ident.eq_ignore_ascii_case(name)));
        before - self.out[self.dep].len()
    }

    /// Remove STAR edges carrying the given procedure name
    pub fn remove_star_named(&mut self, name: &str) -> usize {
        let dest = self.dest;
        let mut removed = 0;
        for edges in self.out.iter_mut() {
            let before = edges.len();
            edges.retain(|e| {
                !(e.to == dest && e.kind == EdgeKind::Star && e.ident.eq_ignore_ascii_case(name))
            });
            removed += before - edges.len();
        }
        removed
    }

    /// Restrict the band of all edges of an airway; empty bands remove
    pub fn restrict_airway_band(&mut self, airway: &str, closed: (i32, i32)) -> usize {
        let mut touched = 0;
        for edges in self.out.iter_mut() {
            edges.retain_mut(|e| {
                if e.kind != EdgeKind::Airway || !e.ident.eq_ignore_ascii_case(airway) {
                    return true;
                }
                touched += 1;
                match subtract_band((e.lower_fl, e.upper_fl), closed) {
                    Some((lo, hi)) => {
                        e.lower_fl = lo;
                        e.upper_fl = hi;
                        true
                    }
                    None => false,
                }
            });
        }
        touched
    }

    /// Remove every edge of the airway regardless of level
    pub fn remove_airway(&mut self, airway: &str) -> usize {
        let mut removed = 0;
        for edges in self.out.iter_mut() {
            let before = edges.len();
            edges.retain(|e| !(e.kind == EdgeKind::Airway && e.ident.eq_ignore_ascii_case(airway)));
            removed += before - edges.len();
        }
        removed
    }

    /// Raise the lower band of the airway to the given level
    pub fn raise_airway_base(&mut self, airway: &str, fl: i32) -> usize {
        let mut touched = 0;
        for edges in self.out.iter_mut() {
            edges.retain_mut(|e| {
                if e.kind != EdgeKind::Airway || !e.ident.eq_ignore_ascii_case(airway) {
                    return true;
                }
                touched += 1;
                e.lower_fl = e.lower_fl.max(fl);
                e.lower_fl <= e.upper_fl
            });
        }
        touched
    }

    /// Remove the DCT edges between two named fixes, both directions
    pub fn remove_dct_between(&mut self, a: &str, b: &str) -> usize {
        let mut removed = 0;
        let idents: Vec<String> = self.vertices.iter().map(|v| v.ident.clone()).collect();
        for (u, edges) in self.out.iter_mut().enumerate() {
            let uident = &idents[u];
            let before = edges.len();
            edges.retain(|e| {
                let vident = &idents[e.to];
                let dct_like = matches!(
                    e.kind,
                    EdgeKind::DirectTo | EdgeKind::Sid | EdgeKind::Star
                ) && e.ident.is_empty();
                !(dct_like
                    && ((uident.eq_ignore_ascii_case(a) && vident.eq_ignore_ascii_case(b))
                        || (uident.eq_ignore_ascii_case(b) && vident.eq_ignore_ascii_case(a))))
            });
            removed += before - edges.len();
        }
        removed
    }

    /// Delete all edges incident on vertices with the given ident
    pub fn remove_vertex_edges(&mut self, ident: &str) -> usize {
        let targets: Vec<usize> = self
            .vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.ident.eq_ignore_ascii_case(ident))
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for (u, edges) in self.out.iter_mut().enumerate() {
            let before = edges.len();
            if targets.contains(&u) {
                edges.clear();
            } else {
                edges.retain(|e| !targets.contains(&e.to));
            }
            removed += before - edges.len();
        }
        removed
    }

    /// Multiply the metric of all edges matching the airway name
    pub fn scale_edge_metric(&mut self, airway: &str, factor: f64) -> usize {
        let mut touched = 0;
        for edges in self.out.iter_mut() {
            for e in edges.iter_mut() {
                if e.ident.eq_ignore_ascii_case(airway) {
                    e.metric *= factor;
                    touched += 1;
                }
            }
        }
        touched
    }

    /// Remove DCT edges crossing the rectangle within the level band
    pub fn remove_dct_inside(&mut self, rect: &Rect, band: (i32, i32)) -> usize {
        self.remove_kind_inside(rect, band, EdgeKind::DirectTo)
    }

    /// Remove airway edges crossing the rectangle within the level band
    pub fn remove_airway_inside(&mut self, rect: &Rect, band: (i32, i32)) -> usize {
        self.remove_kind_inside(rect, band, EdgeKind::Airway)
    }

    fn remove_kind_inside(&mut self, rect: &Rect, band: (i32, i32), kind: EdgeKind) -> usize {
        let coords: Vec<Coord> = self.vertices.iter().map(|v| v.coord).collect();
        let mut removed = 0;
        for (u, edges) in self.out.iter_mut().enumerate() {
            let before = edges.len();
            edges.retain_mut(|e| {
                if e.kind != kind {
                    return true;
                }
                let crosses = rect.contains(&coords[u])
                    || rect.contains(&coords[e.to])
                    || rect.intersects_segment(&coords[u], &coords[e.to]);
                if !crosses {
                    return true;
                }
                match subtract_band((e.lower_fl, e.upper_fl), band) {
                    Some((lo, hi)) => {
                        e.lower_fl = lo;
                        e.upper_fl = hi;
                        true
                    }
                    None => false,
                }
            });
            removed += before - edges.len();
        }
        removed
    }

    /// Lower the upper band of every edge; empty bands remove
    pub fn cap_top_level(&mut self, fl: i32) -> usize {
        let mut touched = 0;
        for edges in self.out.iter_mut() {
            edges.retain_mut(|e| {
                if e.upper_fl <= fl {
                    return true;
                }
                touched += 1;
                e.upper_fl = fl;
                e.lower_fl <= e.upper_fl
            });
        }
        touched
    }
}

/// Remove `closed` from `band`; None when nothing remains. When the closure
/// splits the band, the larger remaining side wins.
fn subtract_band(band: (i32, i32), closed: (i32, i32)) -> Option<(i32, i32)> {
    let (lo, hi) = band;
    let (clo, chi) = closed;
    if chi < lo || clo > hi {
        return Some(band);
    }
    let below = if clo > lo { Some((lo, clo - 1)) } else { None };
    let above = if chi < hi { Some((chi + 1, hi)) } else { None };
    match (below, above) {
        (Some(b), Some(a)) => {
            if (b.1 - b.0) >= (a.1 - a.0) {
                Some(b)
            } else {
                Some(a)
            }
        }
        (Some(b), None) => Some(b),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract_band() {
        assert_eq!(subtract_band((0, 600), (100, 200)), Some((201, 600)));
        assert_eq!(subtract_band((0, 150), (100, 200)), Some((0, 99)));
        assert_eq!(subtract_band((100, 200), (0, 600)), None);
        assert_eq!(subtract_band((0, 100), (200, 300)), Some((0, 100)));
    }

    fn tiny_graph() -> RouteGraph {
        let mut g = RouteGraph::default();
        for (ident, lat, lon) in [
            ("LSZH", 47.46, 8.55),
            ("VEBIT", 47.0, 8.7),
            ("SOPER", 46.3, 8.8),
            ("LIMC", 45.63, 8.72),
        ] {
            g.vertices.push(Vertex {
                ident: ident.into(),
                name: ident.into(),
                coord: Coord::new(lat, lon),
                kind: if ident.starts_with('L') && ident.len() == 4 {
                    WaypointKind::Airport
                } else {
                    WaypointKind::Intersection
                },
                elevation_ft: 0,
            });
            g.out.push(Vec::new());
        }
        g.dep = 0;
        g.dest = 3;
        g.out[0].push(Edge {
            to: 1,
            ident: "VEBIT1G".into(),
            lower_fl: 0,
            upper_fl: 600,
            kind: EdgeKind::Sid,
            dist_nmi: 20.0,
            metric: 20.0,
        });
        g.out[1].push(Edge {
            to: 2,
            ident: "UL613".into(),
            lower_fl: 100,
            upper_fl: 460,
            kind: EdgeKind::Airway,
            dist_nmi: 40.0,
            metric: 40.0,
        });
        g.out[1].push(Edge {
            to: 2,
            ident: String::new(),
            lower_fl: 0,
            upper_fl: 600,
            kind: EdgeKind::DirectTo,
            dist_nmi: 40.0,
            metric: 44.0,
        });
        g.out[2].push(Edge {
            to: 3,
            ident: String::new(),
            lower_fl: 0,
            upper_fl: 600,
            kind: EdgeKind::Star,
            dist_nmi: 40.0,
            metric: 40.0,
        });
        g
    }

    #[test]
    fn test_parallel_edges_distinguished() {
        let g = tiny_graph();
        assert_eq!(g.out_edges(1).len(), 2);
    }

    #[test]
    fn test_remove_airway() {
        let mut g = tiny_graph();
        assert_eq!(g.remove_airway("UL613"), 1);
        assert_eq!(g.out_edges(1).len(), 1);
        assert_eq!(g.remove_airway("UL613"), 0);
    }

    #[test]
    fn test_restrict_airway_band_removal_when_empty() {
        let mut g = tiny_graph();
        assert_eq!(g.restrict_airway_band("UL613", (0, 600)), 1);
        assert!(g.out_edges(1).iter().all(|e| e.kind != EdgeKind::Airway));
    }

    #[test]
    fn test_raise_airway_base() {
        let mut g = tiny_graph();
        g.raise_airway_base("UL613", 250);
        let e = g
            .out_edges(1)
            .iter()
            .find(|e| e.kind == EdgeKind::Airway)
            .unwrap();
        assert_eq!(e.lower_fl, 250);
    }

    #[test]
    fn test_remove_dct_between() {
        let mut g = tiny_graph();
        assert_eq!(g.remove_dct_between("VEBIT", "SOPER"), 1);
        assert_eq!(g.remove_dct_between("VEBIT", "SOPER"), 0);
    }

    #[test]
    fn test_remove_vertex_edges() {
        let mut g = tiny_graph();
        let removed = g.remove_vertex_edges("SOPER");
        // the airway edge, the DCT edge and the outgoing STAR edge
        assert_eq!(removed, 3);
    }

    #[test]
    fn test_sid_removed_by_name() {
        let mut g = tiny_graph();
        assert_eq!(g.remove_sid_named("VEBIT1G"), 1);
        assert!(g.out_edges(0).is_empty());
    }

    #[test]
    fn test_cap_top_level() {
        let mut g = tiny_graph();
        g.cap_top_level(90);
        // airway edge lower bound 100 > cap: removed
        assert!(g.out_edges(1).iter().all(|e| e.kind != EdgeKind::Airway));
    }

    #[test]
    fn test_find_by_ident_nearest() {
        let g = tiny_graph();
        assert_eq!(g.find_by_ident("vebit", &Coord::new(47.0, 8.7)), Some(1));
        assert_eq!(g.find_by_ident("XXXXX", &Coord::new(47.0, 8.7)), None);
    }
}
