//! Iteration controller.
//!
//! Owns the configuration, the derived routing state (performance table,
//! graph, current route) and the validator peer. A run alternates
//! shortest-path search with external validation, feeding every diagnostic
//! through the mapper until the plan is accepted or a budget runs out.
//! Status and log events accumulate in an internal queue the driver drains
//! after each call; a `stopping-*` status is always the final event of a
//! run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aircraft::Aircraft;
use crate::config::{Crossing, RouterConfig};
use crate::fplan::{FplRoute, FplWaypoint, PathCode, WaypointKind};
use crate::geom::Coord;
use crate::graph::{EdgeKind, GraphBuild, RouteGraph};
use crate::icaofpl;
use crate::navdata::{AirportRecord, MapElementKind, NavDatabase};
use crate::opsperf::OpsPerfDb;
use crate::performance::{OptTarget, PerfSpec, Performance};
use crate::pogo::PogoTable;
use crate::precomp::GraphTile;
use crate::rules::{self, DiagnosticMapper, GraphMutation};
use crate::solver::{self, SolverSpec};
use crate::validator::{SocketSpec, ValidateOutcome, ValidatorClient, ValidatorSettings};
use crate::weather;
use crate::wind::WeatherProvider;

pub const STATUS_STARTING: u16 = 1 << 0;
pub const STATUS_STOPPING_DONE: u16 = 1 << 1;
pub const STATUS_ERR_SID: u16 = 1 << 2;
pub const STATUS_ERR_STAR: u16 = 1 << 3;
pub const STATUS_ERR_ENROUTE: u16 = 1 << 4;
pub const STATUS_ERR_VALIDATOR_TIMEOUT: u16 = 1 << 5;
pub const STATUS_ERR_INTERNAL: u16 = 1 << 6;
pub const STATUS_ERR_ITERATION: u16 = 1 << 7;
pub const STATUS_ERR_USER: u16 = 1 << 8;
pub const STATUS_NEW_FPL: u16 = 1 << 9;
pub const STATUS_NEW_VALIDATE_RESPONSE: u16 = 1 << 10;
pub const STATUS_STOPPING_ERROR: u16 = STATUS_ERR_SID
    | STATUS_ERR_STAR
    | STATUS_ERR_ENROUTE
    | STATUS_ERR_VALIDATOR_TIMEOUT
    | STATUS_ERR_INTERNAL
    | STATUS_ERR_ITERATION
    | STATUS_ERR_USER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    FplProposal,
    FplLocalValidation,
    FplRemoteValidation,
    GraphRule,
    GraphRuleDesc,
    GraphRuleOprGoal,
    GraphChange,
    PrecompGraph,
    Weather,
    Normal,
    Debug0,
    Debug1,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::FplProposal => "fplproposal",
            LogKind::FplLocalValidation => "fpllocalvalidation",
            LogKind::FplRemoteValidation => "fplremotevalidation",
            LogKind::GraphRule => "graphrule",
            LogKind::GraphRuleDesc => "graphruledesc",
            LogKind::GraphRuleOprGoal => "graphruleoprgoal",
            LogKind::GraphChange => "graphchange",
            LogKind::PrecompGraph => "precompgraph",
            LogKind::Weather => "weatherdata",
            LogKind::Normal => "normal",
            LogKind::Debug0 => "debug0",
            LogKind::Debug1 => "debug1",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Status(u16),
    Log { kind: LogKind, text: String },
    NewPlan(Box<FplRoute>),
}

/// Outcome of one controller iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterOutcome {
    Continue,
    Done,
    Stopped,
}

/// Command lines arriving while an iteration is in flight. Stop and quit
/// act immediately; anything else is deferred to the driver.
pub struct CommandIntake {
    rx: Option<mpsc::Receiver<String>>,
    pub deferred: VecDeque<String>,
}

impl CommandIntake {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx: Some(rx),
            deferred: VecDeque::new(),
        }
    }

    pub fn none() -> Self {
        Self {
            rx: None,
            deferred: VecDeque::new(),
        }
    }

    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.rx {
            Some(rx) => match rx.recv().await {
                Some(line) => Some(line),
                None => {
                    self.rx = None;
                    std::future::pending().await
                }
            },
            None => std::future::pending().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<String> {
        if let Some(line) = self.deferred.pop_front() {
            return Some(line);
        }
        match &mut self.rx {
            Some(rx) => rx.try_recv().ok(),
            None => None,
        }
    }

    /// Driver-facing receive: deferred lines first, then the channel;
    /// None once the channel is closed and drained.
    pub async fn next(&mut self) -> Option<String> {
        if let Some(line) = self.deferred.pop_front() {
            return Some(line);
        }
        match &mut self.rx {
            Some(rx) => match rx.recv().await {
                Some(line) => Some(line),
                None => {
                    self.rx = None;
                    None
                }
            },
            None => None,
        }
    }
}

fn is_stop_command(line: &str) -> bool {
    matches!(
        line.split_whitespace().next(),
        Some("stop") | Some("quit")
    )
}

fn make_callsign() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..3)
        .map(|_| (rng.gen_range(b'A'..=b'Z')) as char)
        .collect();
    format!("HB{suffix}")
}

pub struct Controller {
    cfg: RouterConfig,
    db: Arc<dyn NavDatabase>,
    weather: Arc<dyn WeatherProvider>,
    opsperf: OpsPerfDb,
    pub aircraft: Aircraft,
    pogo: PogoTable,
    performance: Performance,
    graph: Option<RouteGraph>,
    route: FplRoute,
    validation_response: Vec<String>,
    validator: ValidatorClient,
    mapper: DiagnosticMapper,
    events: VecDeque<Event>,
    running: bool,
    done: bool,
    iteration: [u32; 2],
    run_started: Option<Instant>,
    elapsed: Duration,
    validator_time: Duration,
    cancel: CancellationToken,
    fallback_callsign: String,
    log_dir: Option<PathBuf>,
    /// Effective IFR flags for the current run (snapshot semantics)
    run_ifr: (bool, bool),
}

impl Controller {
    pub fn new(
        db: Arc<dyn NavDatabase>,
        weather: Arc<dyn WeatherProvider>,
        opsperf: OpsPerfDb,
        pogo: PogoTable,
    ) -> Self {
        Self {
            cfg: RouterConfig::default(),
            db,
            weather,
            opsperf,
            aircraft: Aircraft::default(),
            pogo,
            performance: Performance::default(),
            graph: None,
            route: FplRoute::new(),
            validation_response: Vec::new(),
            validator: ValidatorClient::new(ValidatorSettings::default()),
            mapper: DiagnosticMapper::new(),
            events: VecDeque::new(),
            running: false,
            done: false,
            iteration: [0, 0],
            run_started: None,
            elapsed: Duration::ZERO,
            validator_time: Duration::ZERO,
            cancel: CancellationToken::new(),
            fallback_callsign: make_callsign(),
            log_dir: None,
            run_ifr: (true, true),
        }
    }

    // ---- accessors ----

    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    pub fn config_mut(&mut self) -> &mut RouterConfig {
        &mut self.cfg
    }

    pub fn route(&self) -> &FplRoute {
        &self.route
    }

    pub fn validation_response(&self) -> &[String] {
        &self.validation_response
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn local_iterations(&self) -> u32 {
        self.iteration[0]
    }

    pub fn remote_iterations(&self) -> u32 {
        self.iteration[1]
    }

    pub fn wallclock_secs(&self) -> f64 {
        match self.run_started {
            Some(t) if self.running => (self.elapsed + t.elapsed()).as_secs_f64(),
            _ => self.elapsed.as_secs_f64(),
        }
    }

    pub fn validator_secs(&self) -> f64 {
        self.validator_time.as_secs_f64()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn gc_distance_nmi(&self) -> f64 {
        match (&self.cfg.departure, &self.cfg.destination) {
            (Some(a), Some(b)) => a.coord.distance_nmi(&b.coord),
            _ => 0.0,
        }
    }

    pub fn route_distance_nmi(&self) -> f64 {
        self.route.total_distance_nmi()
    }

    /// Time over the great circle at the fastest cruise row, seconds
    pub fn min_time_secs(&self) -> f64 {
        let gc = self.gc_distance_nmi();
        (0..self.performance.len())
            .filter_map(|i| self.performance.cruise(i))
            .map(|c| gc * c.secpernmi)
            .fold(f64::INFINITY, f64::min)
            .min(f64::MAX)
    }

    pub fn min_fuel_usg(&self) -> f64 {
        let gc = self.gc_distance_nmi();
        (0..self.performance.len())
            .filter_map(|i| self.performance.cruise(i))
            .map(|c| gc * c.secpernmi * c.fuelpersec)
            .fold(f64::INFINITY, f64::min)
            .min(f64::MAX)
    }

    pub fn plan_text(&self) -> String {
        icaofpl::format_plan(&icaofpl::FormatParams {
            route: &self.route,
            aircraft: &self.aircraft,
            performance: &self.performance,
            alternates: &self.cfg.alternates,
            fallback_callsign: &self.fallback_callsign,
            started_at: Utc::now(),
            pogo: self.is_pogo_pair(),
        })
    }

    fn is_pogo_pair(&self) -> bool {
        match (&self.cfg.departure, &self.cfg.destination) {
            (Some(a), Some(b)) => self.pogo.is_pogo(&a.icao, &b.icao),
            _ => false,
        }
    }

    // ---- events ----

    fn log(&mut self, kind: LogKind, text: impl Into<String>) {
        self.events.push_back(Event::Log {
            kind,
            text: text.into(),
        });
    }

    fn status(&mut self, mask: u16) {
        self.events.push_back(Event::Status(mask));
    }

    // ---- configuration helpers needing database access ----

    /// Resolve an aerodrome by ICAO and/or name. Exact matches beat
    /// containment matches; ambiguity fails the lookup.
    pub fn find_airport(&self, icao: &str, name: &str) -> Option<AirportRecord> {
        let mut found = Vec::new();
        if !icao.is_empty() {
            found.extend(self.db.airports_by_icao(icao, false));
        }
        if !name.is_empty() {
            found.extend(self.db.airports_by_name(name, false));
        }
        found.dedup_by(|a, b| a.icao == b.icao && a.coord == b.coord);
        if found.len() == 1 {
            return found.pop();
        }
        let icao_u = icao.to_ascii_uppercase();
        let name_u = name.to_ascii_uppercase();
        let mut scored: Vec<(i32, AirportRecord)> = found
            .into_iter()
            .map(|a| {
                let mut prio = 0;
                let au = a.icao.to_ascii_uppercase();
                let nu = a.name.to_ascii_uppercase();
                if !icao_u.is_empty() {
                    if au == icao_u {
                        prio -= 2;
                    } else if au.contains(&icao_u) {
                        prio -= 1;
                    }
                }
                if !name_u.is_empty() {
                    if nu == name_u {
                        prio -= 2;
                    } else if nu.contains(&name_u) {
                        prio -= 1;
                    }
                }
                (prio, a)
            })
            .collect();
        scored.sort_by_key(|(p, _)| *p);
        match scored.as_slice() {
            [] => None,
            [(p, _)] if *p == 0 => None,
            [(p1, _), (p2, _), ..] if p1 == p2 => None,
            _ => Some(scored.remove(0).1),
        }
    }

    /// Resolve a fix name to a coordinate. IFR lookups search navaids and
    /// intersections; VFR also accepts airports and routable map elements.
    /// The candidate nearest to `near` wins.
    pub fn find_point(
        &self,
        name: &str,
        ifr: bool,
        near: Option<Coord>,
    ) -> Option<(Coord, String, WaypointKind)> {
        if name.is_empty() {
            return None;
        }
        let mut candidates: Vec<(Coord, String, WaypointKind)> = Vec::new();
        for n in self.db.navaids_by_ident(name, true) {
            candidates.push((n.coord, n.ident, WaypointKind::Navaid));
        }
        for i in self.db.intersections_by_name(name, true) {
            candidates.push((i.coord, i.name, WaypointKind::Intersection));
        }
        if !ifr {
            for a in self.db.airports_by_icao(name, true) {
                candidates.push((a.coord, a.icao, WaypointKind::Airport));
            }
            for m in self.db.mapelements_by_name(name, true) {
                if m.kind != MapElementKind::Other {
                    candidates.push((m.coord, m.name, WaypointKind::MapElement));
                }
            }
        }
        match near {
            None => {
                if candidates.len() == 1 {
                    candidates.pop()
                } else {
                    None
                }
            }
            Some(refpt) => candidates.into_iter().min_by(|a, b| {
                a.0.distance_nmi(&refpt).total_cmp(&b.0.distance_nmi(&refpt))
            }),
        }
    }

    /// Invalidate everything derived from routing-relevant configuration
    pub fn invalidate_routing(&mut self) {
        self.graph = None;
        self.route.clear();
        self.validation_response.clear();
        self.done = false;
    }

    /// Additionally drop the performance table (levels, aircraft,
    /// atmosphere or optimization changed)
    pub fn invalidate_performance(&mut self) {
        self.performance = Performance::default();
        self.invalidate_routing();
    }

    /// Idempotent: a second call with the same target does not clear
    pub fn set_opt_target(&mut self, t: OptTarget) {
        if self.cfg.opt_target != t {
            self.cfg.opt_target = t;
            self.invalidate_performance();
        }
    }

    pub fn sync_validator_settings(&mut self) {
        self.validator.update_settings(ValidatorSettings {
            socket: self
                .cfg
                .validator_socket
                .as_deref()
                .map(SocketSpec::parse),
            binary: self.cfg.validator_binary.clone(),
            xdisplay: self.cfg.validator_xdisplay,
            backend: self.cfg.validator,
        });
    }

    /// Warm the validator peer, rule sets and weather layers
    pub async fn preload(&mut self, with_validator: bool) {
        if with_validator {
            self.sync_validator_settings();
            if self.validator.settings().is_configured() {
                if let Err(e) = self.validator.preload().await {
                    self.log(LogKind::Normal, format!("Cannot run validator: {e}"));
                }
            }
        }
        if let Some(path) = self.cfg.rules_savefile.clone()
            && path.exists()
        {
            match rules::load_rulesets(&path) {
                Ok(sets) => {
                    self.cfg.disabled_rules = sets.disabled.clone();
                    self.cfg.trace_rules = sets.trace.clone();
                    self.mapper.disabled = sets.disabled;
                    self.mapper.trace = sets.trace;
                }
                Err(e) => self.log(LogKind::Normal, format!("Rule set file ignored: {e}")),
            }
        }
        let nlayers = self.weather.layer_count(crate::wind::WeatherParam::WindU);
        self.log(LogKind::Normal, format!("Loaded {nlayers} wind layers"));
    }

    pub fn clear(&mut self) {
        self.stop(STATUS_ERR_USER);
        self.route.clear();
        self.validation_response.clear();
        self.done = false;
    }

    /// Stop the current run. The mask selects the reported error unless the
    /// run already produced an accepted plan.
    pub fn stop(&mut self, mask: u16) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        if self.running {
            if let Some(t) = self.run_started.take() {
                self.elapsed += t.elapsed();
            }
            self.running = false;
            if self.done {
                self.status(STATUS_STOPPING_DONE);
            } else {
                let mut sm = mask & STATUS_STOPPING_ERROR;
                if sm == 0 {
                    sm = STATUS_ERR_INTERNAL;
                }
                self.status(sm);
            }
            metrics::counter!("controller.runs_stopped_total").increment(1);
        }
    }

    fn make_log_dir(&mut self) {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dir = if self.cfg.log_prefix.is_empty() {
            std::env::temp_dir().join(format!("cfmuautoroute-{stamp}"))
        } else {
            PathBuf::from(format!("{}{stamp}", self.cfg.log_prefix))
        };
        match std::fs::create_dir_all(&dir) {
            Ok(()) => self.log_dir = Some(dir),
            Err(e) => {
                self.log(
                    LogKind::Normal,
                    format!("Cannot open logging directory {}: {e}", dir.display()),
                );
                self.log_dir = None;
            }
        }
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        self.log_dir.as_ref()
    }

    fn build_performance(&mut self) {
        let (dep_elev, dest_elev, dep_coord, dest_coord) =
            match (&self.cfg.departure, &self.cfg.destination) {
                (Some(a), Some(b)) => (
                    a.elevation_ft as f64,
                    b.elevation_ft as f64,
                    a.coord,
                    b.coord,
                ),
                _ => return,
            };
        let spec = PerfSpec {
            base_level: self.cfg.base_level,
            top_level: self.cfg.top_level,
            qnh: self.cfg.qnh_hpa,
            isaoffs: self.cfg.isa_offset_c,
            opt: self.cfg.opt_target,
            preferred_level: self.cfg.preferred_level,
            preferred_penalty: self.cfg.preferred_penalty,
            preferred_climb: self.cfg.preferred_climb,
            preferred_descent: self.cfg.preferred_descent,
            engine: self.cfg.engine,
            honour_levelchange_trackmiles: self.cfg.honour_levelchange_trackmiles,
            honour_opsperf_trackmiles: self.cfg.honour_opsperf_trackmiles,
            wind_enabled: self.cfg.wind_enabled,
            deptime: self.cfg.deptime,
            dep_elevation_ft: dep_elev,
            dest_elevation_ft: dest_elev,
            dep_coord,
            dest_coord,
        };
        let opsacft = self.opsperf.find_aircraft(&self.aircraft.icaotype);
        self.performance =
            Performance::build(&spec, &self.aircraft, &opsacft, self.weather.as_ref());
        for line in self.performance.dump_lines() {
            self.log(LogKind::Normal, line);
        }
    }

    fn build_graph(&mut self) -> bool {
        let top_fl_cap = self
            .cfg
            .top_level
            .min((self.aircraft.ceiling_ft() / 100.0) as i32);
        let tile = if self.cfg.precomp_graph_enabled {
            self.cfg
                .precomp_graph_path
                .as_ref()
                .and_then(|p| match GraphTile::load(p) {
                    Ok(t) => Some(t),
                    Err(e) => {
                        self.events.push_back(Event::Log {
                            kind: LogKind::PrecompGraph,
                            text: format!("precomputed graph unavailable: {e}"),
                        });
                        None
                    }
                })
                .filter(|t| {
                    self.cfg
                        .bbox()
                        .map(|bb| t.covers(&bb.oversize_nmi(100.0)))
                        .unwrap_or(false)
                })
        } else {
            None
        };
        if tile.is_some() {
            self.log(LogKind::PrecompGraph, "using precomputed graph tile");
        }
        let build = GraphBuild {
            cfg: &self.cfg,
            db: self.db.as_ref(),
            top_fl_cap,
            tile: tile.as_ref(),
        };
        match RouteGraph::build(&build) {
            Ok(g) => {
                self.log(
                    LogKind::Debug0,
                    format!(
                        "routing graph: {} vertices, {} edges",
                        g.vertex_count(),
                        g.edge_count()
                    ),
                );
                self.graph = Some(g);
                true
            }
            Err(e) => {
                self.log(LogKind::Normal, format!("Cannot build routing graph: {e}"));
                false
            }
        }
    }

    /// Start (or continue) a run. Returns true when the controller is now
    /// Running and iterations must be driven; false when the run already
    /// finished inside this call (error, VFR, POGO).
    pub async fn begin(&mut self, cont: bool) -> bool {
        self.stop(STATUS_ERR_USER);
        self.make_log_dir();
        self.done = false;
        if !cont {
            self.iteration = [0, 0];
            self.elapsed = Duration::ZERO;
            self.validator_time = Duration::ZERO;
            self.graph = None;
            self.mapper.reset();
        }
        self.mapper.disabled = self.cfg.disabled_rules.clone();
        self.mapper.trace = self.cfg.trace_rules.clone();
        self.sync_validator_settings();
        self.run_started = Some(Instant::now());
        self.running = true;
        self.status(STATUS_STARTING);
        metrics::counter!("controller.runs_started_total").increment(1);

        let (dep, dest) = match (self.cfg.departure.clone(), self.cfg.destination.clone()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                if self.cfg.departure.is_none() {
                    self.log(LogKind::Normal, "Invalid Departure Aerodrome");
                }
                if self.cfg.destination.is_none() {
                    self.log(LogKind::Normal, "Invalid Destination Aerodrome");
                }
                self.stop(STATUS_ERR_INTERNAL);
                return false;
            }
        };

        if self.performance.is_empty() {
            self.build_performance();
        }
        if self.performance.is_empty() {
            self.log(
                LogKind::Normal,
                "Performance calculation error - aircraft unable to climb to minimum level",
            );
            self.stop(STATUS_ERR_INTERNAL);
            return false;
        }

        // aerodromes that cannot take IFR degrade to VFR with forced enroute IFR
        let mut force_enroute = self.cfg.force_enroute_ifr;
        let mut dep_ifr = self.cfg.departure_ifr;
        let mut dest_ifr = self.cfg.destination_ifr;
        if dep_ifr && !dep.flightrules.dep_ifr && dep.flightrules.dep_vfr {
            dep_ifr = false;
            force_enroute = true;
        }
        if dest_ifr && !dest.flightrules.arr_ifr && dest.flightrules.arr_vfr {
            dest_ifr = false;
            force_enroute = true;
        }
        self.run_ifr = (dep_ifr, dest_ifr);

        if !(dep_ifr || dest_ifr || force_enroute) {
            self.log(LogKind::Normal, "Starting VFR router");
            let ok = self.run_vfr();
            if ok {
                self.iteration[0] = 1;
                self.done = true;
                self.emit_plan();
            }
            self.stop(STATUS_ERR_ENROUTE);
            return false;
        }

        if dep_ifr && dest_ifr && self.run_pogo(&dep, &dest) {
            return false;
        }
        true
    }

    /// POGO special case: fixed single-DCT plan, no search, no validator
    fn run_pogo(&mut self, dep: &AirportRecord, dest: &AirportRecord) -> bool {
        let Some(altitude) = self.pogo.lookup(&dep.icao, &dest.icao) else {
            return false;
        };
        info!(dep = %dep.icao, dest = %dest.icao, altitude, "POGO pair, fixed plan");
        self.route.clear();
        self.route.time_offblock_unix = self.cfg.deptime.timestamp();
        self.route.waypoints.push(FplWaypoint {
            icao: dep.icao.clone(),
            name: dep.name.clone(),
            coord: dep.coord,
            altitude_ft: altitude,
            pathcode: PathCode::DirectTo,
            kind: WaypointKind::Airport,
            ifr: true,
            ..FplWaypoint::default()
        });
        self.route.waypoints.push(FplWaypoint {
            icao: dest.icao.clone(),
            name: dest.name.clone(),
            coord: dest.coord,
            altitude_ft: altitude,
            kind: WaypointKind::Airport,
            ifr: true,
            ..FplWaypoint::default()
        });
        weather::bind_route(
            &mut self.route,
            &self.performance,
            self.cfg.wind_enabled,
            self.cfg.qnh_hpa,
            self.cfg.isa_offset_c,
        );
        self.iteration[0] = 1;
        self.done = true;
        self.emit_plan();
        self.stop(0);
        true
    }

    fn run_vfr(&mut self) -> bool {
        let cruise_alt = {
            let mid = self.performance.len() / 2;
            self.performance
                .cruise(mid)
                .map(|c| c.altitude_ft as i32)
                .unwrap_or(0)
        };
        let Some(mut router) = crate::vfr::VfrRouter::new(self.db.as_ref(), &self.cfg) else {
            self.log(LogKind::Debug0, "VFR router: cannot establish bounding box");
            return false;
        };
        if !router.set_endpoints() {
            self.log(LogKind::Debug0, "VFR router: cannot find endpoints");
            return false;
        }
        let have_sid = router.add_sid();
        let have_star = router.add_star();
        router.add_dct(
            self.cfg.dctlimit_nmi,
            if have_sid {
                None
            } else {
                Some(self.cfg.sid.limit_nmi)
            },
            if have_star {
                None
            } else {
                Some(self.cfg.star.limit_nmi)
            },
        );
        router.exclude_airspace(
            self.cfg.base_level,
            self.cfg.top_level,
            self.cfg.vfr_airspace_limit_nmi2,
        );
        router.exclude_regions();
        let Some(mut route) = router.route(cruise_alt) else {
            self.log(LogKind::Debug0, "VFR router: cannot find route");
            return false;
        };
        route.time_offblock_unix = self.cfg.deptime.timestamp();
        weather::bind_route(
            &mut route,
            &self.performance,
            self.cfg.wind_enabled,
            self.cfg.qnh_hpa,
            self.cfg.isa_offset_c,
        );
        self.route = route;
        true
    }

    fn emit_plan(&mut self) {
        let plan = self.plan_text();
        self.events
            .push_back(Event::NewPlan(Box::new(self.route.clone())));
        self.status(STATUS_NEW_FPL);
        self.log(LogKind::FplProposal, plan);
    }

    /// Derive the route skeleton from a solved path
    fn route_from_path(&self, path: &solver::SolvedPath) -> FplRoute {
        let graph = self.graph.as_ref().expect("graph present when solved");
        let mut route = FplRoute::new();
        route.time_offblock_unix = self.cfg.deptime.timestamp();
        let n = path.legs.len();
        for (i, leg) in path.legs.iter().enumerate() {
            if i == 0 {
                let v = graph.vertex(leg.from);
                route.waypoints.push(FplWaypoint {
                    icao: v.ident.clone(),
                    name: v.name.clone(),
                    coord: v.coord,
                    altitude_ft: v.elevation_ft,
                    standard: false,
                    ifr: self.run_ifr.0,
                    pathcode: edge_pathcode(leg.edge_kind),
                    pathname: leg.edge_ident.clone(),
                    kind: v.kind,
                    ..FplWaypoint::default()
                });
            }
            let v = graph.vertex(leg.to);
            let last = i + 1 == n;
            let alt_level = if last {
                leg.level_index
            } else {
                path.legs[i + 1].level_index
            };
            let altitude = self
                .performance
                .cruise(alt_level)
                .map(|c| c.altitude_ft as i32)
                .unwrap_or(v.elevation_ft);
            route.waypoints.push(FplWaypoint {
                icao: v.ident.clone(),
                name: v.name.clone(),
                coord: v.coord,
                altitude_ft: if last { v.elevation_ft } else { altitude },
                standard: !last,
                ifr: if last { self.run_ifr.1 } else { true },
                pathcode: if last {
                    PathCode::None
                } else {
                    edge_pathcode(path.legs[i + 1].edge_kind)
                },
                pathname: if last {
                    String::new()
                } else {
                    path.legs[i + 1].edge_ident.clone()
                },
                kind: v.kind,
                ..FplWaypoint::default()
            });
        }
        route
    }

    /// Apply one mapped mutation; returns a description of what changed
    fn apply_mutation(&mut self, m: &GraphMutation) -> String {
        if self.graph.is_none() {
            return String::from("no graph");
        }
        fn with_graph(g: &mut Option<RouteGraph>, f: impl FnOnce(&mut RouteGraph) -> usize) -> usize {
            g.as_mut().map(f).unwrap_or(0)
        }
        let affected = match m {
            GraphMutation::RemoveSid { name } => {
                let n = with_graph(&mut self.graph, |g| g.remove_sid_named(name));
                if self.cfg.sid.proc_only {
                    // no procedures left to try; fall back to DCT anchors
                    self.cfg.sid.proc_only = false;
                    self.graph = None;
                }
                n
            }
            GraphMutation::RemoveStar { name } => {
                let n = with_graph(&mut self.graph, |g| g.remove_star_named(name));
                if self.cfg.star.proc_only {
                    self.cfg.star.proc_only = false;
                    self.graph = None;
                }
                n
            }
            GraphMutation::RestrictAirwayBand {
                airway,
                from_fl,
                to_fl,
            } => with_graph(&mut self.graph, |g| {
                g.restrict_airway_band(airway, (*from_fl, *to_fl))
            }),
            GraphMutation::RemoveAirway { airway } => {
                with_graph(&mut self.graph, |g| g.remove_airway(airway))
            }
            GraphMutation::RemoveDct { from, to } => {
                with_graph(&mut self.graph, |g| g.remove_dct_between(from, to))
            }
            GraphMutation::RaiseAirwayBase { airway, fl } => {
                with_graph(&mut self.graph, |g| g.raise_airway_base(airway, *fl))
            }
            GraphMutation::ClosePoint { ident } => {
                with_graph(&mut self.graph, |g| g.remove_vertex_edges(ident))
            }
            GraphMutation::EnableProfileRules { .. } => {
                self.cfg.honour_profile_rules = true;
                self.graph = None;
                0
            }
            GraphMutation::AddCrossing { ident } => {
                let near = self
                    .cfg
                    .departure
                    .as_ref()
                    .map(|a| a.coord)
                    .unwrap_or_default();
                if let Some((coord, id, kind)) = self.find_point(ident, true, Some(near)) {
                    self.cfg.crossings.push(Crossing {
                        ident: id,
                        coord: Some(coord),
                        kind,
                        radius_nmi: 10.0,
                        minlevel: 0,
                        maxlevel: 600,
                    });
                    self.graph = None;
                    1
                } else {
                    0
                }
            }
            GraphMutation::LowerTopLevel { fl } => {
                if *fl < self.cfg.top_level {
                    self.cfg.top_level = *fl;
                    let n = with_graph(&mut self.graph, |g| g.cap_top_level(*fl));
                    self.performance = Performance::default();
                    n
                } else {
                    0
                }
            }
        };
        metrics::counter!("graph.mutations_total").increment(1);
        format!("{m} ({affected} edges)")
    }

    /// One inner-loop iteration: solve, format, validate, map. Commands
    /// arriving through the intake act during the validator wait.
    pub async fn iterate(&mut self, intake: &mut CommandIntake) -> IterOutcome {
        if !self.running {
            return IterOutcome::Stopped;
        }
        if self.performance.is_empty() {
            self.build_performance();
            if self.performance.is_empty() {
                self.log(LogKind::Normal, "Performance table empty");
                self.stop(STATUS_ERR_INTERNAL);
                return IterOutcome::Stopped;
            }
        }
        if self.graph.is_none() && !self.build_graph() {
            self.stop(STATUS_ERR_INTERNAL);
            return IterOutcome::Stopped;
        }

        // local iteration: search
        self.iteration[0] += 1;
        let solved = {
            let graph = self.graph.as_ref().expect("graph built above");
            solver::search(&SolverSpec {
                graph,
                perf: &self.performance,
                honour_awy_levels: self.cfg.honour_awy_levels,
                honour_opsperf_trackmiles: self.cfg.honour_opsperf_trackmiles,
                wind_enabled: self.cfg.wind_enabled,
            })
        };
        let Some(path) = solved else {
            let graph = self.graph.as_ref().expect("graph built above");
            let mask = if graph.out_edges(graph.dep).is_empty() {
                STATUS_ERR_SID
            } else if !graph.has_in_edges(graph.dest) {
                STATUS_ERR_STAR
            } else {
                STATUS_ERR_ENROUTE
            };
            self.log(LogKind::Normal, "No route found");
            self.stop(mask);
            return IterOutcome::Stopped;
        };
        if path.legs.is_empty() {
            // identical endpoints solve trivially but are not a plan
            self.log(LogKind::Normal, "No route found");
            self.stop(STATUS_ERR_ENROUTE);
            return IterOutcome::Stopped;
        }

        let mut route = self.route_from_path(&path);
        weather::bind_route(
            &mut route,
            &self.performance,
            self.cfg.wind_enabled,
            self.cfg.qnh_hpa,
            self.cfg.isa_offset_c,
        );
        self.route = route;
        self.log(
            LogKind::FplLocalValidation,
            format!(
                "route {:.1} nmi, {} waypoints, cost {:.1}",
                self.route.total_distance_nmi(),
                self.route.len(),
                path.cost
            ),
        );
        self.emit_plan();

        if self.iteration[0] >= self.cfg.max_local_iterations {
            self.stop(STATUS_ERR_ITERATION);
            return IterOutcome::Stopped;
        }

        let plan = self.plan_text();
        if !self.validator.settings().is_configured() {
            // no validator: accept the local plan
            debug!("no validator configured, accepting local plan");
            self.done = true;
            self.stop(0);
            return IterOutcome::Done;
        }

        let cancel = self.cancel.clone();
        let vstart = Instant::now();
        let outcome = {
            let fut = self.validator.validate(&plan, &cancel);
            let mut fut = std::pin::pin!(fut);
            loop {
                tokio::select! {
                    r = &mut fut => break r,
                    line = intake.recv() => {
                        if let Some(line) = line {
                            if is_stop_command(&line) {
                                cancel.cancel();
                            }
                            intake.deferred.push_back(line);
                        }
                    }
                }
            }
        };
        self.validator_time += vstart.elapsed();

        let lines = match outcome {
            Ok(ValidateOutcome::Response(lines)) => lines,
            Ok(ValidateOutcome::Cancelled) => {
                self.stop(STATUS_ERR_USER);
                return IterOutcome::Stopped;
            }
            Ok(ValidateOutcome::TimedOut) => {
                self.log(LogKind::Normal, "Validator timed out, stopping...");
                self.stop(STATUS_ERR_VALIDATOR_TIMEOUT);
                return IterOutcome::Stopped;
            }
            Err(e) => {
                self.log(LogKind::Normal, format!("Cannot run validator: {e}"));
                self.stop(STATUS_ERR_VALIDATOR_TIMEOUT);
                return IterOutcome::Stopped;
            }
        };

        self.iteration[1] += 1;
        self.validation_response = lines.clone();
        self.status(STATUS_NEW_VALIDATE_RESPONSE);
        for line in &lines {
            self.log(LogKind::FplRemoteValidation, line.clone());
        }

        if lines.is_empty() || lines.iter().all(|l| rules::is_acceptance(l)) {
            self.done = true;
            self.stop(0);
            return IterOutcome::Done;
        }

        let mut mutations = 0usize;
        for line in lines {
            let out = self.mapper.map_line(&line);
            if out.traced {
                self.log(LogKind::GraphRuleDesc, format!("TRACE {line}"));
            }
            if let Some(m) = out.mutation {
                self.log(LogKind::GraphRule, out.code.clone());
                self.log(LogKind::GraphRuleDesc, line.clone());
                let desc = self.apply_mutation(&m);
                self.log(LogKind::GraphChange, desc);
                mutations += 1;
            }
        }

        if mutations == 0 {
            self.log(
                LogKind::Normal,
                "Validator rejected the plan and no rule matched, stopping...",
            );
            self.stop(STATUS_ERR_ITERATION);
            return IterOutcome::Stopped;
        }
        if self.iteration[1] >= self.cfg.max_remote_iterations {
            self.stop(STATUS_ERR_ITERATION);
            return IterOutcome::Stopped;
        }
        IterOutcome::Continue
    }

    /// Persist the mutable rule sets when a savefile is configured
    pub fn save_rulesets(&mut self) {
        if let Some(path) = self.cfg.rules_savefile.clone() {
            let sets = rules::RuleSets {
                disabled: self.cfg.disabled_rules.clone(),
                trace: self.cfg.trace_rules.clone(),
            };
            if let Err(e) = rules::save_rulesets(&path, &sets) {
                warn!("Cannot save rule sets: {e}");
            }
        }
    }

    /// Close the validator peer and reap any child process
    pub async fn shutdown(&mut self) {
        self.stop(STATUS_ERR_USER);
        self.validator.close().await;
        self.save_rulesets();
    }
}

fn edge_pathcode(kind: EdgeKind) -> PathCode {
    match kind {
        EdgeKind::Sid => PathCode::Sid,
        EdgeKind::Star => PathCode::Star,
        EdgeKind::Airway => PathCode::Airway,
        EdgeKind::DirectTo | EdgeKind::Anchor => PathCode::DirectTo,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navdata::{FlightRules, MemoryNavDatabase};
    use crate::wind::NullWeatherProvider;

    fn airport(icao: &str, lat: f64, lon: f64, elev: i32) -> AirportRecord {
        AirportRecord {
            icao: icao.into(),
            name: icao.into(),
            coord: Coord::new(lat, lon),
            elevation_ft: elev,
            flightrules: FlightRules::all(),
            vfr_routes: Vec::new(),
        }
    }

    fn controller_with(db: MemoryNavDatabase) -> Controller {
        Controller::new(
            Arc::new(db),
            Arc::new(NullWeatherProvider),
            OpsPerfDb::new(),
            PogoTable::builtin(),
        )
    }

    #[tokio::test]
    async fn test_begin_without_endpoints_is_internal_error() {
        let mut c = controller_with(MemoryNavDatabase::new());
        assert!(!c.begin(false).await);
        let events = c.take_events();
        let last = events
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::Status(m) => Some(*m),
                _ => None,
            })
            .unwrap();
        assert_eq!(last, STATUS_ERR_INTERNAL);
    }

    #[tokio::test]
    async fn test_pogo_pair_completes_without_search() {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(airport("LFPG", 49.009722, 2.547778, 392));
        db.airports.push(airport("LFPO", 48.723333, 2.379444, 291));
        let mut c = controller_with(db);
        c.config_mut().departure = c.find_airport("LFPG", "");
        c.config_mut().destination = c.find_airport("LFPO", "");
        assert!(!c.begin(false).await);
        assert!(c.is_done());
        assert_eq!(c.local_iterations(), 1);
        assert_eq!(c.remote_iterations(), 0);
        let events = c.take_events();
        assert!(events.iter().any(|e| matches!(e, Event::NewPlan(_))));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::Status(m) if *m == STATUS_STOPPING_DONE))
        );
        // single DCT at the fixed POGO level
        assert_eq!(c.route().len(), 2);
        assert_eq!(c.route().waypoints[0].pathcode, PathCode::DirectTo);
        assert_eq!(c.route().waypoints[0].altitude_ft, 3000);
        assert!(c.plan_text().contains("RMK/POGO"));
    }

    #[tokio::test]
    async fn test_departure_above_ceiling_is_internal_error() {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(airport("SCEL", -33.393056, -70.785833, 1555));
        db.airports.push(airport("SCFA", -23.444722, -70.445278, 455));
        let mut c = controller_with(db);
        c.config_mut().departure = c.find_airport("SCEL", "");
        c.config_mut().destination = c.find_airport("SCFA", "");
        // base level above the default aircraft ceiling
        c.config_mut().set_levels(250, 300);
        assert!(!c.begin(false).await);
        let events = c.take_events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::Status(m) if *m == STATUS_ERR_INTERNAL))
        );
    }

    #[tokio::test]
    async fn test_set_opt_target_idempotent() {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(airport("LFPG", 49.009722, 2.547778, 392));
        db.airports.push(airport("LFPO", 48.723333, 2.379444, 291));
        let mut c = controller_with(db);
        c.config_mut().departure = c.find_airport("LFPG", "");
        c.config_mut().destination = c.find_airport("LFPO", "");
        assert!(!c.begin(false).await);
        assert!(c.route().len() == 2);
        // same target again must not clear the route
        c.set_opt_target(OptTarget::Time);
        assert_eq!(c.route().len(), 2);
        c.set_opt_target(OptTarget::Fuel);
        assert_eq!(c.route().len(), 0);
    }

    #[test]
    fn test_clear_twice_is_noop() {
        let mut c = controller_with(MemoryNavDatabase::new());
        c.clear();
        let first: usize = c.take_events().len();
        c.clear();
        let second = c.take_events().len();
        assert_eq!(first, second);
    }

    #[test]
    fn test_find_airport_disambiguation() {
        let mut db = MemoryNavDatabase::new();
        db.airports.push(airport("LSZH", 47.458056, 8.548056, 1417));
        db.airports.push(airport("LSZB", 46.913056, 7.497778, 1674));
        let c = controller_with(db);
        assert_eq!(c.find_airport("LSZH", "").unwrap().icao, "LSZH");
        // ambiguous prefix
        assert!(c.find_airport("LSZ", "").is_none());
        assert!(c.find_airport("XXXX", "").is_none());
    }
}
