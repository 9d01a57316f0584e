//! Minimum-metric path search.
//!
//! Dijkstra over the product space (vertex, cruise row, crossings satisfied).
//! Cruise rows include a ground sentinel which is only enterable at the
//! endpoints; level transitions between rows cost the precomputed
//! level-change penalty, edges cost their effective distance times the
//! per-level metric, wind-corrected when a grid is bound.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, trace};

use crate::graph::{EdgeKind, RouteGraph};
use crate::performance::Performance;

/// Upper bound on crossing constraints (bits of the search mask)
pub const MAX_CROSSINGS: usize = 24;

#[derive(Debug, Clone)]
pub struct SolverSpec<'a> {
    pub graph: &'a RouteGraph,
    pub perf: &'a Performance,
    pub honour_awy_levels: bool,
    pub honour_opsperf_trackmiles: bool,
    pub wind_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SolvedLeg {
    pub from: usize,
    pub to: usize,
    /// Performance row flown on this leg
    pub level_index: usize,
    pub edge_ident: String,
    pub edge_kind: EdgeKind,
    pub dist_nmi: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SolvedPath {
    pub legs: Vec<SolvedLeg>,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct State {
    vertex: u32,
    level: u16,
    mask: u32,
}

#[derive(Debug, Clone)]
struct HeapEntry {
    cost: f64,
    state: State,
    /// Track distance since the last level change, for opsperf gating
    run_nmi: f64,
    tiebreak: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; invert for min ordering. Ties resolve by
    // lower level, then lexicographically lower arriving edge ident, then
    // lower vertex index, for reproducible plans.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.state.level.cmp(&self.state.level))
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
            .then_with(|| other.state.vertex.cmp(&self.state.vertex))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Arrived via an out-edge of the predecessor vertex
    Edge { from: usize, edge_idx: usize },
    /// Level transition in place
    Level,
}

fn is_metric_invalid(m: f64) -> bool {
    m.is_nan() || m.is_infinite() || m == f64::MAX
}

/// Crossing bits satisfied by standing at `vertex` on row `level`
fn crossing_bits(graph: &RouteGraph, perf: &Performance, vertex: usize, level: usize) -> u32 {
    let Some(cruise) = perf.cruise(level) else {
        return 0;
    };
    let mut bits = 0u32;
    for (k, zone) in graph.crossings.iter().enumerate().take(MAX_CROSSINGS) {
        if cruise.level >= zone.minlevel
            && cruise.level <= zone.maxlevel
            && zone.members.contains(&vertex)
        {
            bits |= 1 << k;
        }
    }
    bits
}

pub fn search(spec: &SolverSpec) -> Option<SolvedPath> {
    let graph = spec.graph;
    let perf = spec.perf;
    let ground = perf.ground_index();
    if perf.is_empty() || graph.vertex_count() == 0 {
        return None;
    }
    let ncross = graph.crossings.len().min(MAX_CROSSINGS);
    let full_mask: u32 = if ncross == 0 { 0 } else { (1u32 << ncross) - 1 };

    let start = State {
        vertex: graph.dep as u32,
        level: ground as u16,
        mask: 0,
    };
    let goal_vertex = graph.dest as u32;

    let mut best: HashMap<State, f64> = HashMap::new();
    let mut prev: HashMap<State, (State, Step)> = HashMap::new();
    let mut heap = BinaryHeap::new();
    best.insert(start, 0.0);
    heap.push(HeapEntry {
        cost: 0.0,
        state: start,
        run_nmi: 0.0,
        tiebreak: String::new(),
    });

    let mut goal: Option<State> = None;
    while let Some(entry) = heap.pop() {
        let state = entry.state;
        match best.get(&state) {
            Some(&c) if entry.cost > c + 1e-9 => continue,
            None => continue,
            _ => {}
        }
        if state.vertex == goal_vertex && state.level as usize == ground && state.mask == full_mask
        {
            goal = Some(state);
            break;
        }
        let u = state.vertex as usize;
        let li = state.level as usize;

        let mut relax = |heap: &mut BinaryHeap<HeapEntry>,
                         best: &mut HashMap<State, f64>,
                         prev: &mut HashMap<State, (State, Step)>,
                         next: State,
                         cost: f64,
                         run: f64,
                         step: Step,
                         tiebreak: &str| {
            let better = match best.get(&next) {
                Some(&c) => cost < c - 1e-9,
                None => true,
            };
            if better {
                best.insert(next, cost);
                prev.insert(next, (state, step));
                heap.push(HeapEntry {
                    cost,
                    state: next,
                    run_nmi: run,
                    tiebreak: tiebreak.to_string(),
                });
            }
        };

        // level transitions in place
        if li == ground {
            // initial climb, departure only
            if u == graph.dep {
                for lj in 0..perf.len() {
                    let lc = perf.levelchange(ground, lj);
                    if lc.is_forbidden() || is_metric_invalid(lc.metricpenalty) {
                        continue;
                    }
                    let bits = crossing_bits(graph, perf, u, lj);
                    let next = State {
                        vertex: state.vertex,
                        level: lj as u16,
                        mask: state.mask | bits,
                    };
                    relax(
                        &mut heap,
                        &mut best,
                        &mut prev,
                        next,
                        entry.cost + lc.metricpenalty.max(0.0),
                        0.0,
                        Step::Level,
                        "",
                    );
                }
            }
        } else {
            // final descent, destination only
            if u == graph.dest {
                let lc = perf.levelchange(li, ground);
                if !lc.is_forbidden() && !is_metric_invalid(lc.metricpenalty) {
                    let next = State {
                        vertex: state.vertex,
                        level: ground as u16,
                        mask: state.mask,
                    };
                    relax(
                        &mut heap,
                        &mut best,
                        &mut prev,
                        next,
                        entry.cost + lc.metricpenalty.max(0.0),
                        0.0,
                        Step::Level,
                        "",
                    );
                }
            }
            // cruise level change
            for lj in 0..perf.len() {
                if lj == li {
                    continue;
                }
                let lc = perf.levelchange(li, lj);
                if lc.is_forbidden() || is_metric_invalid(lc.metricpenalty) {
                    continue;
                }
                if spec.honour_opsperf_trackmiles
                    && lc.opsperf_tracknmi > 0.0
                    && entry.run_nmi < lc.opsperf_tracknmi
                {
                    continue;
                }
                let bits = crossing_bits(graph, perf, u, lj);
                let next = State {
                    vertex: state.vertex,
                    level: lj as u16,
                    mask: state.mask | bits,
                };
                // preferred-mode descents may carry a negative reward
                let cost = entry.cost + lc.metricpenalty.max(0.0);
                relax(
                    &mut heap,
                    &mut best,
                    &mut prev,
                    next,
                    cost,
                    0.0,
                    Step::Level,
                    "",
                );
            }

            // edge relaxations at this cruise row
            let cruise = perf.cruise(li).expect("li < ground");
            for (ei, e) in graph.out_edges(u).iter().enumerate() {
                let band_ok = if e.kind == EdgeKind::Airway && !spec.honour_awy_levels {
                    true
                } else {
                    e.permits_level(cruise.level)
                };
                if !band_ok || is_metric_invalid(e.metric) {
                    continue;
                }
                let mut cost = e.metric * cruise.metricpernmi;
                if spec.wind_enabled && cruise.has_wind() {
                    let from = &graph.vertex(u).coord;
                    let to = &graph.vertex(e.to).coord;
                    let mid = from.halfway(to);
                    let mut wind = cruise.wind(&mid);
                    wind.set_crs_tas(from.true_course_deg(to), cruise.tas_kts());
                    if wind.gs_kts() < 0.1 {
                        continue;
                    }
                    cost *= cruise.tas_kts() / wind.gs_kts();
                }
                if is_metric_invalid(cost) {
                    continue;
                }
                let bits = crossing_bits(graph, perf, e.to, li);
                let next = State {
                    vertex: e.to as u32,
                    level: state.level,
                    mask: state.mask | bits,
                };
                relax(
                    &mut heap,
                    &mut best,
                    &mut prev,
                    next,
                    entry.cost + cost,
                    entry.run_nmi + e.dist_nmi,
                    Step::Edge { from: u, edge_idx: ei },
                    &e.ident,
                );
            }
        }
    }

    let goal = goal?;
    let cost = *best.get(&goal)?;

    // walk back, keeping the edge steps
    let mut legs = Vec::new();
    let mut cur = goal;
    while cur != start {
        let (pstate, step) = *prev.get(&cur)?;
        if let Step::Edge { from, edge_idx } = step {
            let e = &graph.out_edges(from)[edge_idx];
            legs.push(SolvedLeg {
                from,
                to: e.to,
                level_index: cur.level as usize,
                edge_ident: e.ident.clone(),
                edge_kind: e.kind,
                dist_nmi: e.dist_nmi,
            });
        }
        cur = pstate;
    }
    legs.reverse();
    debug!(legs = legs.len(), cost, "shortest path found");
    trace!(?legs, "solved path");
    Some(SolvedPath { legs, cost })
}
