#![allow(dead_code)]
//! Shared fixtures for the end-to-end routing tests.
//!
//! Provides a synthetic aeronautical database covering the tested city
//! pairs and a scripted mock validator speaking the wire protocol over a
//! Unix socket: one response (a list of diagnostic lines) per received
//! plan, each terminated by an empty line.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use cfmuautoroute::controller::Controller;
use cfmuautoroute::geom::{AreaPolygon, Coord};
use cfmuautoroute::navdata::{
    AirportRecord, AirspaceCategory, AirspaceRecord, AirwaySegment, FlightRules,
    MemoryNavDatabase, NavaidRecord, ProcedureKind, ProcedureRecord,
};
use cfmuautoroute::opsperf::OpsPerfDb;
use cfmuautoroute::pogo::PogoTable;
use cfmuautoroute::wind::NullWeatherProvider;

pub fn airport(icao: &str, lat: f64, lon: f64, elev: i32) -> AirportRecord {
    AirportRecord {
        icao: icao.into(),
        name: icao.into(),
        coord: Coord::new(lat, lon),
        elevation_ft: elev,
        flightrules: FlightRules::all(),
        vfr_routes: Vec::new(),
    }
}

fn navaid(ident: &str, lat: f64, lon: f64) -> NavaidRecord {
    NavaidRecord {
        ident: ident.into(),
        name: ident.into(),
        coord: Coord::new(lat, lon),
    }
}

fn airway(name: &str, from: &NavaidRecord, to: &NavaidRecord, base: i32, top: i32) -> AirwaySegment {
    AirwaySegment {
        airway: name.into(),
        from_ident: from.ident.clone(),
        from_coord: from.coord,
        to_ident: to.ident.clone(),
        to_coord: to.coord,
        base_fl: base,
        top_fl: top,
    }
}

fn sid(airport: &str, name: &str, terminal: &NavaidRecord, track: f64) -> ProcedureRecord {
    ProcedureRecord {
        airport_icao: airport.into(),
        name: name.into(),
        kind: ProcedureKind::Sid,
        terminal_ident: terminal.ident.clone(),
        terminal_coord: terminal.coord,
        track_nmi: track,
    }
}

fn star(airport: &str, name: &str, entry: &NavaidRecord, track: f64) -> ProcedureRecord {
    ProcedureRecord {
        airport_icao: airport.into(),
        name: name.into(),
        kind: ProcedureKind::Star,
        terminal_ident: entry.ident.clone(),
        terminal_coord: entry.coord,
        track_nmi: track,
    }
}

/// Synthetic navdata for every scenario in one database
pub fn fixture_db() -> MemoryNavDatabase {
    let mut db = MemoryNavDatabase::new();

    // Zurich - Milano
    db.airports.push(airport("LSZH", 47.458056, 8.548056, 1417));
    db.airports.push(airport("LIMC", 45.63, 8.723056, 768));
    let vebit = navaid("VEBIT", 47.2, 8.6);
    let soper = navaid("SOPER", 46.5, 8.7);
    let odina = navaid("ODINA", 45.9, 8.7);
    db.airways.push(airway("UL613", &vebit, &soper, 80, 460));
    db.airways.push(airway("UL613", &soper, &odina, 80, 460));
    db.procedures.push(sid("LSZH", "VEBIT1G", &vebit, 18.0));
    db.procedures.push(star("LIMC", "ODINA2A", &odina, 18.0));
    db.navaids.extend([vebit, soper, odina]);

    // London - Frankfurt, with a closable airway and an alternative
    db.airports.push(airport("EGLL", 51.4775, -0.461389, 83));
    db.airports.push(airport("EDDF", 50.033333, 8.570556, 364));
    let dvr = navaid("DVR", 51.1617, 1.3593);
    let kok = navaid("KOK", 51.0945, 2.6522);
    let nik = navaid("NIK", 51.1649, 4.1894);
    let redfa = navaid("REDFA", 50.75, 3.0);
    let gmh = navaid("GMH", 50.25, 7.5);
    db.airways.push(airway("UL612", &dvr, &kok, 90, 460));
    db.airways.push(airway("UL612", &kok, &nik, 90, 460));
    db.airways.push(airway("UL612", &nik, &gmh, 90, 460));
    db.airways.push(airway("UL610", &dvr, &redfa, 90, 460));
    db.airways.push(airway("UL610", &redfa, &gmh, 90, 460));
    db.procedures.push(sid("EGLL", "DVR2F", &dvr, 52.0));
    db.procedures.push(star("EDDF", "GMH1A", &gmh, 50.0));
    db.navaids.extend([dvr, kok, nik, redfa, gmh]);

    // Innsbruck - Zurich, with the KPT crossing
    db.airports.push(airport("LOWI", 47.260278, 11.343889, 1907));
    let inn = navaid("INN", 47.3, 11.5);
    let kpt = navaid("KPT", 47.074861, 10.849056);
    let sulus = navaid("SULUS", 47.1, 9.9);
    let tra = navaid("TRA", 47.689444, 8.437222);
    db.airways.push(airway("Y100", &inn, &kpt, 100, 460));
    db.airways.push(airway("Y100", &kpt, &sulus, 100, 460));
    db.airways.push(airway("Y101", &sulus, &tra, 100, 460));
    db.procedures.push(sid("LOWI", "INN1J", &inn, 10.0));
    db.procedures.push(star("LSZH", "TRA3G", &tra, 19.0));
    db.navaids.extend([inn, kpt, sulus, tra]);

    // Paris VFR pair with a prohibited area on the direct line
    db.airports.push(airport("LFPN", 48.751667, 2.106111, 538));
    db.airports.push(airport("LFPV", 48.774167, 2.201667, 587));
    db.navaids.push(navaid("PNORD", 48.85, 2.15));
    db.navaids.push(navaid("PSUD", 48.69, 2.15));
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

    // POGO pair
    db.airports.push(airport("LFPG", 49.009722, 2.547778, 392));
    db.airports.push(airport("LFPO", 48.723333, 2.379444, 291));

    db
}

pub fn make_controller(db: MemoryNavDatabase) -> Controller {
    Controller::new(
        Arc::new(db),
        Arc::new(NullWeatherProvider),
        OpsPerfDb::new(),
        PogoTable::builtin(),
    )
}

/// Scripted validator peer. Responses are handed out one per received
/// plan, in order; once the script is exhausted every further plan is
/// answered with "NO ERRORS". When `silent` is set the peer reads plans
/// but never answers.
pub struct MockValidator {
    pub socket_path: PathBuf,
    pub requests: Arc<AtomicUsize>,
    pub connections: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

impl MockValidator {
    pub fn spawn(responses: Vec<Vec<String>>, silent: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("validator.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind mock validator");
        let requests = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let reqs = requests.clone();
        let conns = connections.clone();
        tokio::spawn(async move {
            let responses = Arc::new(tokio::sync::Mutex::new(
                responses.into_iter().collect::<std::collections::VecDeque<_>>(),
            ));
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                let reqs = reqs.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut lines = BufReader::new(r).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.starts_with("validate*:") || line.trim().is_empty() {
                            continue;
                        }
                        reqs.fetch_add(1, Ordering::SeqCst);
                        if silent {
                            continue;
                        }
                        let response = responses
                            .lock()
                            .await
                            .pop_front()
                            .unwrap_or_else(|| vec!["NO ERRORS".to_string()]);
                        let mut buf = String::new();
                        for l in response {
                            buf.push_str(&l);
                            buf.push('\n');
                        }
                        buf.push('\n');
                        if w.write_all(buf.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self {
            socket_path,
            requests,
            connections,
            _dir: dir,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}
