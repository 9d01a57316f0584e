use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cfmuautoroute::aircraft::Aircraft;
use cfmuautoroute::commands;
use cfmuautoroute::config::{Crossing, ExcludeRegion, ExcludeSpec, ValidatorChoice};
use cfmuautoroute::controller::Controller;
use cfmuautoroute::fplan::WaypointKind;
use cfmuautoroute::geom::{Coord, Rect};
use cfmuautoroute::navdata::MemoryNavDatabase;
use cfmuautoroute::opsperf::OpsPerfDb;
use cfmuautoroute::performance::OptTarget;
use cfmuautoroute::pogo::PogoTable;
use cfmuautoroute::protocol::TimestampMode;
use cfmuautoroute::wind::{FileWeatherProvider, NullWeatherProvider, WeatherProvider};

const EX_OK: i32 = 0;
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_NOINPUT: i32 = 66;
const EX_UNAVAILABLE: i32 = 69;
const EX_SOFTWARE: i32 = 70;

/// CFMU-compliant IFR flight plan autorouter
#[derive(Debug, Parser)]
#[command(name = "cfmuautoroute", version, about)]
struct Cli {
    /// Main database directory
    #[arg(short = 'm', long)]
    maindir: Option<PathBuf>,
    /// Auxiliary database directory (OpsPerf dataset, rule files)
    #[arg(short = 'a', long)]
    auxdir: Option<PathBuf>,
    /// Log directory prefix
    #[arg(short = 'l', long)]
    logprefix: Option<String>,
    /// Aircraft model file (TOML)
    #[arg(long)]
    aircraft: Option<PathBuf>,

    #[arg(long)]
    dctlimit: Option<f64>,
    #[arg(long)]
    dctpenalty: Option<f64>,
    #[arg(long)]
    dctoffset: Option<f64>,
    /// VFR airspace area limit, nmi^2
    #[arg(long)]
    airspacelimit: Option<f64>,

    #[arg(long)]
    depvfr: bool,
    #[arg(long)]
    depifr: bool,
    #[arg(long)]
    destvfr: bool,
    #[arg(long)]
    destifr: bool,
    #[arg(long, alias = "enrifr", alias = "enrouteifr")]
    forceenrouteifr: bool,

    /// SID anchor: fix ident or lat,lon
    #[arg(long)]
    sid: Option<String>,
    #[arg(long)]
    star: Option<String>,
    #[arg(long)]
    sidlimit: Option<f64>,
    #[arg(long)]
    starlimit: Option<f64>,
    #[arg(long)]
    sidpenalty: Option<f64>,
    #[arg(long)]
    starpenalty: Option<f64>,
    #[arg(long)]
    sidoffset: Option<f64>,
    #[arg(long)]
    staroffset: Option<f64>,
    #[arg(long)]
    sidminimum: Option<f64>,
    #[arg(long)]
    starminimum: Option<f64>,
    #[arg(long = "enable-siddb")]
    enable_siddb: bool,
    #[arg(long = "disable-siddb")]
    disable_siddb: bool,
    #[arg(long = "enable-stardb")]
    enable_stardb: bool,
    #[arg(long = "disable-stardb")]
    disable_stardb: bool,
    #[arg(long = "enable-sidonly")]
    enable_sidonly: bool,
    #[arg(long = "disable-sidonly")]
    disable_sidonly: bool,
    #[arg(long = "enable-staronly")]
    enable_staronly: bool,
    #[arg(long = "disable-staronly")]
    disable_staronly: bool,
    #[arg(long)]
    sidfilter: Vec<String>,
    #[arg(long)]
    starfilter: Vec<String>,
    #[arg(long)]
    alternate1: Option<String>,
    #[arg(long)]
    alternate2: Option<String>,

    /// Mandatory crossing: fix ident or lat,lon (repeatable)
    #[arg(short = 'X', long)]
    crossing: Vec<String>,
    #[arg(long = "crossing-radius")]
    crossing_radius: Option<f64>,
    #[arg(long = "crossing-minlevel")]
    crossing_minlevel: Option<i32>,
    #[arg(long = "crossing-maxlevel")]
    crossing_maxlevel: Option<i32>,

    /// Exclusion: ASPCID/TYPE or rectangle S,W,N,E (repeatable)
    #[arg(short = 'E', long)]
    exclude: Vec<String>,
    #[arg(long = "exclude-minlevel")]
    exclude_minlevel: Option<i32>,
    #[arg(long = "exclude-maxlevel")]
    exclude_maxlevel: Option<i32>,
    #[arg(long = "exclude-awylimit")]
    exclude_awylimit: Option<f64>,
    #[arg(long = "exclude-dctlimit")]
    exclude_dctlimit: Option<f64>,
    #[arg(long = "exclude-dctoffset")]
    exclude_dctoffset: Option<f64>,
    #[arg(long = "exclude-dctscale")]
    exclude_dctscale: Option<f64>,

    #[arg(long)]
    maxdescent: Option<f64>,
    #[arg(long = "enable-levelchangetrackmiles")]
    enable_lvltrk: bool,
    #[arg(long = "disable-levelchangetrackmiles")]
    disable_lvltrk: bool,
    #[arg(long = "enable-opsperftrackmiles")]
    enable_opstrk: bool,
    #[arg(long = "disable-opsperftrackmiles")]
    disable_opstrk: bool,
    #[arg(long = "enable-airway-levels")]
    enable_awylvl: bool,
    #[arg(long = "disable-airway-levels")]
    disable_awylvl: bool,
    #[arg(long = "enable-profile-rules")]
    enable_profile: bool,
    #[arg(long = "disable-profile-rules")]
    disable_profile: bool,
    #[arg(long = "disable-tfr")]
    disable_tfr: bool,
    #[arg(long = "enable-tfr")]
    enable_tfr: bool,
    #[arg(long = "disable-tfr-rules")]
    disable_tfr_rules: Option<String>,
    #[arg(long = "trace-tfr-rules")]
    trace_tfr_rules: Option<String>,
    /// Persist mutated rule sets to this file across sessions
    #[arg(long = "tfr-rules-file")]
    tfr_rules_file: Option<PathBuf>,

    /// Optimize for time (the default)
    #[arg(long)]
    time: bool,
    /// Optimize for fuel
    #[arg(long)]
    fuel: bool,
    /// Optimize towards the preferred level
    #[arg(long)]
    preferred: bool,
    #[arg(long)]
    preferredlevel: Option<i32>,
    #[arg(long)]
    preferredpenalty: Option<f64>,
    #[arg(long)]
    preferredclimb: Option<f64>,
    #[arg(long)]
    preferreddescent: Option<f64>,

    #[arg(long = "enable-precompgraph")]
    enable_precompgraph: bool,
    #[arg(long = "disable-precompgraph")]
    disable_precompgraph: bool,
    /// Precomputed graph tile path
    #[arg(long = "precompgraph-file")]
    precompgraph_file: Option<PathBuf>,
    /// Precompute the graph tile and exit
    #[arg(long)]
    precompute: bool,

    #[arg(long = "validator-binary")]
    validator_binary: Option<PathBuf>,
    #[arg(long = "validator-socket")]
    validator_socket: Option<String>,
    #[arg(long = "validator-default")]
    validator_default: bool,
    #[arg(long = "validator-cfmu")]
    validator_cfmu: bool,
    #[arg(long = "validator-eurofpl")]
    validator_eurofpl: bool,
    #[arg(long)]
    xdisplay: Option<i32>,

    #[arg(short = 'w', long)]
    wind: bool,
    #[arg(short = 'q', long)]
    qnh: Option<f64>,
    #[arg(short = 't', long)]
    isaoffs: Option<f64>,
    #[arg(short = 'R', long)]
    rpm: Option<f64>,
    #[arg(short = 'M', long)]
    mp: Option<f64>,
    #[arg(short = 'B', long)]
    bhp: Option<f64>,

    /// Off-block departure time, unix seconds
    #[arg(long)]
    deptime: Option<i64>,
    #[arg(long)]
    maxlocaliterations: Option<u32>,
    #[arg(long)]
    maxremoteiterations: Option<u32>,

    /// POGO pair table override
    #[arg(long = "pogo-table")]
    pogo_table: Option<PathBuf>,

    /// Prefix machine output with ISO8601 timestamps
    #[arg(long)]
    timestamp: bool,
    /// Prefix machine output with seconds since start
    #[arg(long = "timestamp-relative")]
    timestamp_relative: bool,
    /// Line-based machine command interface on stdin/stdout
    #[arg(long)]
    machineinterface: bool,
    /// Verbose progress on stderr
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Departure aerodrome ICAO
    dep: Option<String>,
    /// Destination aerodrome ICAO
    dest: Option<String>,
    /// Base flight level
    base_fl: Option<i32>,
    /// Top flight level
    top_fl: Option<i32>,
}

/// Parse "lat,lon" or resolve a fix ident through the controller
fn resolve_point(
    controller: &Controller,
    text: &str,
    near: Option<Coord>,
) -> Option<(Coord, String, WaypointKind)> {
    if let Some((lat, lon)) = text.split_once(',')
        && let (Ok(lat), Ok(lon)) = (lat.trim().parse(), lon.trim().parse())
    {
        return Some((Coord::new(lat, lon), String::new(), WaypointKind::Undefined));
    }
    controller.find_point(text, true, near)
}

fn configure(controller: &mut Controller, cli: &Cli) -> Result<(), (i32, String)> {
    if let Some(path) = &cli.aircraft {
        match Aircraft::load_file(path) {
            Ok(acft) => controller.aircraft = acft,
            Err(e) => {
                return Err((
                    EX_NOINPUT,
                    format!("Unable to load aircraft file {}: {e}", path.display()),
                ));
            }
        }
    }
    if let Some(dep) = &cli.dep {
        match controller.find_airport(dep, "") {
            Some(arpt) => controller.config_mut().departure = Some(arpt),
            None => return Err((EX_DATAERR, format!("departure aerodrome {dep} not found"))),
        }
    }
    if let Some(dest) = &cli.dest {
        match controller.find_airport(dest, "") {
            Some(arpt) => controller.config_mut().destination = Some(arpt),
            None => return Err((EX_DATAERR, format!("destination aerodrome {dest} not found"))),
        }
    }
    let dep_coord = controller.config().departure.as_ref().map(|a| a.coord);
    let dest_coord = controller.config().destination.as_ref().map(|a| a.coord);
    if let Some(sid) = &cli.sid {
        match resolve_point(controller, sid, dep_coord) {
            Some((coord, ident, kind)) => {
                let cfg = controller.config_mut();
                cfg.sid.coord = Some(coord);
                cfg.sid.ident = ident;
                cfg.sid.kind = kind;
            }
            None => return Err((EX_DATAERR, format!("SID point {sid} not found"))),
        }
    }
    if let Some(star) = &cli.star {
        match resolve_point(controller, star, dest_coord) {
            Some((coord, ident, kind)) => {
                let cfg = controller.config_mut();
                cfg.star.coord = Some(coord);
                cfg.star.ident = ident;
                cfg.star.kind = kind;
            }
            None => return Err((EX_DATAERR, format!("STAR point {star} not found"))),
        }
    }
    for crossing in &cli.crossing {
        match resolve_point(controller, crossing, dep_coord) {
            Some((coord, ident, kind)) => {
                let mut c = Crossing {
                    ident,
                    coord: Some(coord),
                    kind,
                    ..Crossing::default()
                };
                c.set_radius(cli.crossing_radius.unwrap_or(0.0));
                c.set_level(
                    cli.crossing_minlevel.unwrap_or(0),
                    cli.crossing_maxlevel.unwrap_or(600),
                );
                controller.config_mut().crossings.push(c);
            }
            None => return Err((EX_DATAERR, format!("crossing point {crossing} not found"))),
        }
    }
    for exclude in &cli.exclude {
        let spec = if let Some((id, class)) = exclude.split_once('/') {
            ExcludeSpec::Airspace {
                id: id.to_ascii_uppercase(),
                class: class.to_ascii_uppercase(),
            }
        } else {
            let parts: Vec<f64> = exclude
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            match parts.as_slice() {
                [s, w, n, e] => ExcludeSpec::Bbox(Rect::new(Coord::new(*s, *w), Coord::new(*n, *e))),
                _ => {
                    ExcludeSpec::Airspace {
                        id: exclude.to_ascii_uppercase(),
                        class: String::new(),
                    }
                }
            }
        };
        let mut region = ExcludeRegion::new(spec);
        region.minlevel = cli.exclude_minlevel.unwrap_or(0);
        region.maxlevel = cli.exclude_maxlevel.unwrap_or(600);
        region.awylimit_nmi = cli.exclude_awylimit.unwrap_or(0.0);
        region.dctlimit_nmi = cli.exclude_dctlimit.unwrap_or(0.0);
        region.dctoffset = cli.exclude_dctoffset.unwrap_or(0.0);
        region.dctscale = cli.exclude_dctscale.unwrap_or(1.0);
        controller.config_mut().exclude_regions.push(region);
    }

    let cfg = controller.config_mut();
    if let (Some(base), Some(top)) = (cli.base_fl, cli.top_fl) {
        cfg.set_levels(base, top);
    }
    if let Some(v) = &cli.logprefix {
        cfg.log_prefix = v.clone();
    }
    if let Some(v) = cli.dctlimit {
        cfg.dctlimit_nmi = v;
    }
    if let Some(v) = cli.dctpenalty {
        cfg.dctpenalty = v;
    }
    if let Some(v) = cli.dctoffset {
        cfg.dctoffset = v;
    }
    if let Some(v) = cli.airspacelimit {
        cfg.vfr_airspace_limit_nmi2 = v;
    }
    if cli.depvfr {
        cfg.departure_ifr = false;
    }
    if cli.depifr {
        cfg.departure_ifr = true;
    }
    if cli.destvfr {
        cfg.destination_ifr = false;
    }
    if cli.destifr {
        cfg.destination_ifr = true;
    }
    if cli.forceenrouteifr {
        cfg.force_enroute_ifr = true;
    }
    if let Some(v) = cli.sidlimit {
        cfg.sid.limit_nmi = v;
    }
    if let Some(v) = cli.starlimit {
        cfg.star.limit_nmi = v;
    }
    if let Some(v) = cli.sidpenalty {
        cfg.sid.penalty = v;
    }
    if let Some(v) = cli.starpenalty {
        cfg.star.penalty = v;
    }
    if let Some(v) = cli.sidoffset {
        cfg.sid.offset_nmi = v;
    }
    if let Some(v) = cli.staroffset {
        cfg.star.offset_nmi = v;
    }
    if let Some(v) = cli.sidminimum {
        cfg.sid.minimum_nmi = v;
    }
    if let Some(v) = cli.starminimum {
        cfg.star.minimum_nmi = v;
    }
    if cli.enable_siddb {
        cfg.sid.use_db = true;
    }
    if cli.disable_siddb {
        cfg.sid.use_db = false;
    }
    if cli.enable_stardb {
        cfg.star.use_db = true;
    }
    if cli.disable_stardb {
        cfg.star.use_db = false;
    }
    if cli.enable_sidonly {
        cfg.sid.proc_only = true;
    }
    if cli.disable_sidonly {
        cfg.sid.proc_only = false;
    }
    if cli.enable_staronly {
        cfg.star.proc_only = true;
    }
    if cli.disable_staronly {
        cfg.star.proc_only = false;
    }
    cfg.sid.filter = cli
        .sidfilter
        .iter()
        .map(|f| f.to_ascii_uppercase())
        .collect();
    cfg.star.filter = cli
        .starfilter
        .iter()
        .map(|f| f.to_ascii_uppercase())
        .collect();
    if let Some(v) = &cli.alternate1 {
        cfg.alternates[0] = v.to_ascii_uppercase();
    }
    if let Some(v) = &cli.alternate2 {
        cfg.alternates[1] = v.to_ascii_uppercase();
    }
    if let Some(v) = cli.maxdescent {
        cfg.max_descent_fpm = v;
    }
    if cli.enable_lvltrk {
        cfg.honour_levelchange_trackmiles = true;
    }
    if cli.disable_lvltrk {
        cfg.honour_levelchange_trackmiles = false;
    }
    if cli.enable_opstrk {
        cfg.honour_opsperf_trackmiles = true;
    }
    if cli.disable_opstrk {
        cfg.honour_opsperf_trackmiles = false;
    }
    if cli.enable_awylvl {
        cfg.honour_awy_levels = true;
    }
    if cli.disable_awylvl {
        cfg.honour_awy_levels = false;
    }
    if cli.enable_profile {
        cfg.honour_profile_rules = true;
    }
    if cli.disable_profile {
        cfg.honour_profile_rules = false;
    }
    if cli.enable_tfr {
        cfg.tfr_enabled = true;
    }
    if cli.disable_tfr {
        cfg.tfr_enabled = false;
    }
    if let Some(v) = &cli.disable_tfr_rules {
        cfg.disabled_rules = v
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_ascii_uppercase())
            .collect();
    }
    if let Some(v) = &cli.trace_tfr_rules {
        cfg.trace_rules = v
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_ascii_uppercase())
            .collect();
    }
    if let Some(v) = &cli.tfr_rules_file {
        cfg.rules_savefile = Some(v.clone());
    }
    if cli.time {
        cfg.opt_target = OptTarget::Time;
    }
    if cli.fuel {
        cfg.opt_target = OptTarget::Fuel;
    }
    if cli.preferred {
        cfg.opt_target = OptTarget::Preferred;
    }
    if let Some(v) = cli.preferredlevel {
        cfg.preferred_level = v;
    }
    if let Some(v) = cli.preferredpenalty {
        cfg.preferred_penalty = v;
    }
    if let Some(v) = cli.preferredclimb {
        cfg.preferred_climb = v;
    }
    if let Some(v) = cli.preferreddescent {
        cfg.preferred_descent = v;
    }
    if cli.enable_precompgraph {
        cfg.precomp_graph_enabled = true;
    }
    if cli.disable_precompgraph {
        cfg.precomp_graph_enabled = false;
    }
    if let Some(v) = &cli.precompgraph_file {
        cfg.precomp_graph_path = Some(v.clone());
    }
    if let Some(v) = &cli.validator_binary {
        cfg.validator_binary = Some(v.clone());
    }
    if let Some(v) = &cli.validator_socket {
        cfg.validator_socket = Some(v.clone());
    }
    if cli.validator_default {
        cfg.validator = ValidatorChoice::Default;
    }
    if cli.validator_cfmu {
        cfg.validator = ValidatorChoice::Cfmu;
    }
    if cli.validator_eurofpl {
        cfg.validator = ValidatorChoice::Eurofpl;
    }
    if let Some(v) = cli.xdisplay {
        cfg.validator_xdisplay = Some(v);
    }
    if cli.wind {
        cfg.wind_enabled = true;
    }
    if let Some(v) = cli.qnh {
        cfg.set_qnh(v);
    }
    if let Some(v) = cli.isaoffs {
        cfg.set_isa_offset(v);
    }
    if let Some(v) = cli.rpm {
        cfg.engine.rpm = Some(v);
    }
    if let Some(v) = cli.mp {
        cfg.engine.mp = Some(v);
    }
    if let Some(v) = cli.bhp {
        cfg.engine.bhp = Some(v);
    }
    if let Some(t) = cli.deptime
        && let Some(dt) = DateTime::<Utc>::from_timestamp(t, 0)
    {
        cfg.deptime = dt;
    }
    if let Some(v) = cli.maxlocaliterations {
        cfg.max_local_iterations = v;
    }
    if let Some(v) = cli.maxremoteiterations {
        cfg.max_remote_iterations = v;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EX_USAGE } else { EX_OK });
        }
    };

    let db = match &cli.maindir {
        Some(dir) => match MemoryNavDatabase::load_dir(dir) {
            Ok(db) => db,
            Err(e) => {
                error!("Cannot open database directory {}: {e}", dir.display());
                std::process::exit(EX_NOINPUT);
            }
        },
        None => MemoryNavDatabase::new(),
    };
    let weather: Arc<dyn WeatherProvider> = match &cli.maindir {
        Some(dir) => Arc::new(FileWeatherProvider::load_dir(dir)),
        None => Arc::new(NullWeatherProvider),
    };
    let opsperf = match &cli.auxdir {
        Some(dir) => OpsPerfDb::load_dir(dir),
        None => OpsPerfDb::new(),
    };
    let pogo = match &cli.pogo_table {
        Some(path) => match PogoTable::load_file(path) {
            Ok(t) => t,
            Err(e) => {
                error!("Cannot load POGO table: {e}");
                std::process::exit(EX_NOINPUT);
            }
        },
        None => PogoTable::builtin(),
    };

    let db = Arc::new(db);
    let mut controller = Controller::new(db.clone(), weather, opsperf, pogo);
    if let Err((code, msg)) = configure(&mut controller, &cli) {
        error!("{msg}");
        std::process::exit(code);
    }

    if cli.precompute {
        let out = cli
            .precompgraph_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("graph.tile"));
        match commands::handle_precompute(&controller, db.as_ref(), &out) {
            Ok(()) => std::process::exit(EX_OK),
            Err(e) => {
                error!("Precompute failed: {e}");
                std::process::exit(EX_SOFTWARE);
            }
        }
    }

    if cli.machineinterface {
        let timestamp = if cli.timestamp {
            TimestampMode::Iso8601
        } else if cli.timestamp_relative {
            TimestampMode::Relative
        } else {
            TimestampMode::Off
        };
        match commands::handle_machine(controller, timestamp).await {
            Ok(()) => std::process::exit(EX_OK),
            Err(e) => {
                error!("Machine interface failed: {e}");
                std::process::exit(EX_SOFTWARE);
            }
        }
    }

    if cli.dep.is_none() || cli.dest.is_none() || cli.base_fl.is_none() || cli.top_fl.is_none() {
        eprintln!("usage: cfmuautoroute [options] <dep> <dest> <base-fl> <top-fl>");
        std::process::exit(EX_USAGE);
    }

    match commands::handle_route(controller, cli.verbose).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Routing failed: {e}");
            std::process::exit(EX_UNAVAILABLE);
        }
    }
}
