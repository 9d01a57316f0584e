//! Line-oriented machine protocol.
//!
//! Requests and responses are single lines: a command word followed by
//! whitespace-separated `key=value` pairs with URL-encoded values; list
//! valued keys repeat. Every response mirrors the command name and echoes
//! `cmdseq` when the request carried one; errors reply with `error=<text>`
//! without tearing the loop down. Status, log and flight-plan events are
//! emitted as `autoroute`, `log` and `fplbegin`/`fplwpt`/`fplend` lines.

use std::fmt::Display;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{ExcludeRegion, ExcludeSpec, ValidatorChoice};
use crate::controller::{
    CommandIntake, Controller, Event, IterOutcome, LogKind, STATUS_ERR_ENROUTE, STATUS_ERR_INTERNAL,
    STATUS_ERR_ITERATION, STATUS_ERR_SID, STATUS_ERR_STAR, STATUS_ERR_USER,
    STATUS_ERR_VALIDATOR_TIMEOUT, STATUS_STARTING, STATUS_STOPPING_DONE, STATUS_STOPPING_ERROR,
};
use crate::fplan::FplRoute;
use crate::geom::{Coord, Rect};
use crate::performance::OptTarget;

/// Characters left intact in encoded values
const VALUE_ENC: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b':')
    .remove(b',')
    .remove(b'(')
    .remove(b')');

/// One protocol message
#[derive(Debug, Clone, Default)]
pub struct Command {
    name: String,
    opts: Vec<(String, String)>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            opts: Vec::new(),
        }
    }

    pub fn parse(line: &str) -> Self {
        let mut it = line.split_whitespace();
        let name = it.next().unwrap_or("").to_string();
        let mut opts = Vec::new();
        for tok in it {
            match tok.split_once('=') {
                Some((k, v)) => {
                    let decoded = percent_decode_str(v)
                        .decode_utf8()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| v.to_string());
                    opts.push((k.to_string(), decoded));
                }
                None => opts.push((tok.to_string(), String::new())),
            }
        }
        Self { name, opts }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.opts
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.opts
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.opts.iter().any(|(k, _)| k == key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_u64(key).map(|v| v != 0)
    }

    /// `lat,lon` in decimal degrees
    pub fn get_coord(&self, key: &str) -> Option<Coord> {
        let v = self.get(key)?;
        let (lat, lon) = v.split_once(',')?;
        Some(Coord::new(lat.trim().parse().ok()?, lon.trim().parse().ok()?))
    }

    pub fn set(&mut self, key: &str, value: impl Display) -> &mut Self {
        let raw = value.to_string();
        let encoded = utf8_percent_encode(&raw, VALUE_ENC).to_string();
        self.opts.push((key.to_string(), encoded));
        self
    }

    pub fn set_flag(&mut self, key: &str) -> &mut Self {
        self.opts.push((key.to_string(), String::new()));
        self
    }

    pub fn set_coord(&mut self, key: &str, coord: Coord) -> &mut Self {
        self.set(key, format!("{:.6},{:.6}", coord.lat, coord.lon))
    }

    pub fn to_line(&self) -> String {
        let mut out = self.name.clone();
        for (k, v) in &self.opts {
            out.push(' ');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    #[default]
    Off,
    Iso8601,
    Relative,
}

pub struct MachineInterface<W: AsyncWrite + Unpin> {
    controller: Controller,
    out: W,
    timestamp: TimestampMode,
    started: std::time::Instant,
}

impl<W: AsyncWrite + Unpin> MachineInterface<W> {
    pub fn new(controller: Controller, out: W, timestamp: TimestampMode) -> Self {
        Self {
            controller,
            out,
            timestamp,
            started: std::time::Instant::now(),
        }
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    fn stamp(&self) -> String {
        match self.timestamp {
            TimestampMode::Off => String::new(),
            TimestampMode::Iso8601 => {
                format!("{} ", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            TimestampMode::Relative => {
                format!("{:8.1} ", self.started.elapsed().as_secs_f64())
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stamped = format!("{}{}\n", self.stamp(), line);
        self.out.write_all(stamped.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn write_cmd(&mut self, cmd: &Command) -> Result<()> {
        let line = cmd.to_line();
        self.write_line(&line).await
    }

    /// Drain controller events into protocol lines
    async fn flush_events(&mut self) -> Result<()> {
        for event in self.controller.take_events() {
            match event {
                Event::Status(mask) => self.emit_status(mask).await?,
                Event::Log { kind, text } => {
                    let mut cmd = Command::new("log");
                    cmd.set("item", kind.as_str());
                    cmd.set("text", text);
                    self.write_cmd(&cmd).await?;
                }
                Event::NewPlan(route) => self.emit_plan(&route).await?,
            }
        }
        Ok(())
    }

    async fn emit_status(&mut self, mask: u16) -> Result<()> {
        if mask & (STATUS_STARTING | STATUS_STOPPING_DONE | STATUS_STOPPING_ERROR) == 0 {
            return Ok(());
        }
        let mut cmd = Command::new("autoroute");
        if mask & STATUS_STARTING != 0 {
            cmd.set("status", "starting");
        } else {
            cmd.set("status", "stopping");
            cmd.set(
                "routesuccess",
                u8::from(mask & STATUS_STOPPING_DONE != 0),
            );
            cmd.set("wallclocktime", format!("{:.3}", self.controller.wallclock_secs()));
            cmd.set("validatortime", format!("{:.3}", self.controller.validator_secs()));
            cmd.set("siderror", u8::from(mask & STATUS_ERR_SID != 0));
            cmd.set("starerror", u8::from(mask & STATUS_ERR_STAR != 0));
            cmd.set("enrouteerror", u8::from(mask & STATUS_ERR_ENROUTE != 0));
            cmd.set(
                "validatorerror",
                u8::from(mask & STATUS_ERR_VALIDATOR_TIMEOUT != 0),
            );
            cmd.set("internalerror", u8::from(mask & STATUS_ERR_INTERNAL != 0));
            cmd.set("iterationerror", u8::from(mask & STATUS_ERR_ITERATION != 0));
            cmd.set("userstop", u8::from(mask & STATUS_ERR_USER != 0));
            cmd.set("localiteration", self.controller.local_iterations());
            cmd.set("remoteiteration", self.controller.remote_iterations());
        }
        self.write_cmd(&cmd).await
    }

    async fn emit_plan(&mut self, route: &FplRoute) -> Result<()> {
        {
            let mut cmd = Command::new("fplbegin");
            cmd.set("offblock", route.time_offblock_unix);
            cmd.set("onblock", route.time_onblock_unix);
            self.write_cmd(&cmd).await?;
        }
        for wpt in &route.waypoints {
            let mut cmd = Command::new("fplwpt");
            cmd.set("icao", &wpt.icao);
            cmd.set("name", &wpt.name);
            cmd.set("pathname", &wpt.pathname);
            cmd.set("pathcode", wpt.pathcode.as_str());
            cmd.set("time", wpt.time_unix);
            cmd.set("flighttime", wpt.flighttime_sec);
            cmd.set_coord("coord", wpt.coord);
            cmd.set("lat", format!("{:.6}", wpt.coord.lat));
            cmd.set("lon", format!("{:.6}", wpt.coord.lon));
            cmd.set("altitude", wpt.altitude_ft);
            let mut flags = Vec::new();
            if wpt.standard {
                flags.push("std");
            }
            if wpt.ifr {
                flags.push("ifr");
            }
            if wpt.climb {
                flags.push("climb");
            }
            if wpt.descent {
                flags.push("descent");
            }
            cmd.set("flags", flags.join(","));
            cmd.set("winddir", format!("{:.0}", wpt.winddir_deg));
            cmd.set("windspeed", format!("{:.0}", wpt.windspeed_kts));
            cmd.set("qff", format!("{:.1}", wpt.qff_hpa));
            cmd.set("isaoffset", format!("{:.1}", wpt.isaoffset_k));
            cmd.set("truealt", format!("{:.0}", wpt.truealt_ft));
            cmd.set("dist", format!("{:.2}", wpt.dist_nmi));
            cmd.set("fuel", format!("{:.2}", wpt.fuel_usg));
            cmd.set("tt", format!("{:.1}", wpt.truetrack_deg));
            cmd.set("th", format!("{:.1}", wpt.trueheading_deg));
            cmd.set("tas", format!("{:.0}", wpt.tas_kts));
            cmd.set("type", wpt.kind.as_str());
            self.write_cmd(&cmd).await?;
        }
        {
            let mut cmd = Command::new("fplend");
            cmd.set("gcdist", format!("{:.1}", self.controller.gc_distance_nmi()));
            cmd.set(
                "routedist",
                format!("{:.1}", self.controller.route_distance_nmi()),
            );
            cmd.set("mintime", format!("{:.0}", self.controller.min_time_secs()));
            cmd.set("routetime", format!("{:.0}", route.route_time_sec));
            cmd.set("minfuel", format!("{:.2}", self.controller.min_fuel_usg()));
            cmd.set("routefuel", format!("{:.2}", route.route_fuel_usg));
            cmd.set("routetimezerowind", format!("{:.0}", route.zerowind_time_sec));
            cmd.set("routefuelzerowind", format!("{:.2}", route.zerowind_fuel_usg));
            cmd.set("fpl", self.controller.plan_text());
            cmd.set(
                "iteration",
                self.controller.local_iterations() + self.controller.remote_iterations(),
            );
            cmd.set("localiteration", self.controller.local_iterations());
            cmd.set("remoteiteration", self.controller.remote_iterations());
            cmd.set(
                "wallclocktime",
                format!("{:.3}", self.controller.wallclock_secs()),
            );
            cmd.set(
                "validatortime",
                format!("{:.3}", self.controller.validator_secs()),
            );
            self.write_cmd(&cmd).await?;
        }
        Ok(())
    }

    /// Dispatch one request line; returns false when the loop must exit
    pub async fn dispatch(&mut self, line: &str) -> Result<bool> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(true);
        }
        debug!(line, "machine command");
        let cmdin = Command::parse(line);
        let mut cmdout = Command::new(if cmdin.name().is_empty() {
            "autoroute"
        } else {
            cmdin.name()
        });
        if let Some(seq) = cmdin.get("cmdseq") {
            let seq = seq.to_string();
            cmdout.set("cmdseq", seq);
        }
        let mut keep_running = true;
        let result = match cmdin.name() {
            "nop" => Ok(()),
            "quit" => {
                keep_running = false;
                Ok(())
            }
            "preload" => {
                self.controller.preload(true).await;
                Ok(())
            }
            "start" => {
                self.controller.begin(false).await;
                Ok(())
            }
            "continue" => {
                self.controller.begin(true).await;
                Ok(())
            }
            "stop" => {
                self.controller.stop(STATUS_ERR_USER);
                Ok(())
            }
            "clear" => {
                self.controller.clear();
                Ok(())
            }
            "departure" => self.cmd_departure(&cmdin, &mut cmdout),
            "destination" => self.cmd_destination(&cmdin, &mut cmdout),
            "crossing" => self.cmd_crossing(&cmdin, &mut cmdout),
            "enroute" => self.cmd_enroute(&cmdin, &mut cmdout),
            "levels" => self.cmd_levels(&cmdin, &mut cmdout),
            "exclude" => self.cmd_exclude(&cmdin, &mut cmdout),
            "tfr" => self.cmd_tfr(&cmdin, &mut cmdout),
            "atmosphere" => self.cmd_atmosphere(&cmdin, &mut cmdout),
            "cruise" => self.cmd_cruise(&cmdin, &mut cmdout),
            "optimization" => self.cmd_optimization(&cmdin, &mut cmdout),
            "preferred" => self.cmd_preferred(&cmdin, &mut cmdout),
            "aircraft" => self.cmd_aircraft(&cmdin, &mut cmdout),
            other => Err(anyhow::anyhow!("command not found: {other}")),
        };
        if let Err(e) = result {
            cmdout.set("error", e.to_string());
        }
        self.write_cmd(&cmdout).await?;
        self.flush_events().await?;
        Ok(keep_running)
    }

    fn cmd_departure(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        let icao = cmdin.get("icao").unwrap_or("");
        let name = cmdin.get("name").unwrap_or("");
        if !icao.is_empty() || !name.is_empty() {
            match self.controller.find_airport(icao, name) {
                Some(arpt) => {
                    self.controller.config_mut().departure = Some(arpt);
                    self.controller.invalidate_performance();
                }
                None => {
                    anyhow::bail!("departure aerodrome {icao} {name} not found");
                }
            }
        }
        if cmdin.is_set("ifr") {
            self.controller.config_mut().departure_ifr = true;
            self.controller.invalidate_routing();
        } else if cmdin.is_set("vfr") {
            self.controller.config_mut().departure_ifr = false;
            self.controller.invalidate_routing();
        }
        if let Some(pt) = cmdin.get_coord("sid") {
            let cfg = self.controller.config_mut();
            cfg.sid.coord = Some(pt);
            cfg.sid.ident.clear();
            self.controller.invalidate_routing();
        } else if let Some(ident) = cmdin.get("sidident") {
            let near = self.controller.config().departure.as_ref().map(|a| a.coord);
            match self.controller.find_point(ident, true, near) {
                Some((coord, id, kind)) => {
                    let cfg = self.controller.config_mut();
                    cfg.sid.coord = Some(coord);
                    cfg.sid.ident = id;
                    cfg.sid.kind = kind;
                    self.controller.invalidate_routing();
                }
                None => anyhow::bail!("SID point {ident} not found"),
            }
        }
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("sidlimit") {
                cfg.sid.limit_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("sidpenalty") {
                cfg.sid.penalty = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("sidoffset") {
                cfg.sid.offset_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("sidminimum") {
                cfg.sid.minimum_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("siddb") {
                cfg.sid.use_db = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("sidonly") {
                cfg.sid.proc_only = v;
                dirty = true;
            }
            if cmdin.is_set("sidfilter") {
                cfg.sid.filter = cmdin
                    .get_all("sidfilter")
                    .into_iter()
                    .filter(|f| !f.is_empty())
                    .map(|f| f.to_ascii_uppercase())
                    .collect();
                dirty = true;
            }
            if let Some(t) = cmdin.get_i64("time") {
                if let Some(dt) = DateTime::from_timestamp(t, 0) {
                    cfg.deptime = dt;
                    dirty = true;
                }
            } else if let Some(d) = cmdin.get("date")
                && let Ok(dt) = DateTime::parse_from_rfc3339(d)
            {
                cfg.deptime = dt.with_timezone(&Utc);
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_routing();
            }
        }
        let cfg = self.controller.config();
        if let Some(dep) = &cfg.departure {
            cmdout.set("icao", &dep.icao);
            cmdout.set("name", &dep.name);
            cmdout.set_coord("coord", dep.coord);
        }
        match cfg.sid.coord {
            Some(pt) => {
                cmdout.set_coord("sid", pt);
                cmdout.set("sidtype", cfg.sid.kind.as_str());
                cmdout.set("sidident", &cfg.sid.ident);
            }
            None => {
                cmdout.set("sid", "");
            }
        }
        cmdout.set("sidlimit", cfg.sid.limit_nmi);
        cmdout.set("sidpenalty", cfg.sid.penalty);
        cmdout.set("sidoffset", cfg.sid.offset_nmi);
        cmdout.set("sidminimum", cfg.sid.minimum_nmi);
        cmdout.set("siddb", u8::from(cfg.sid.use_db));
        cmdout.set("sidonly", u8::from(cfg.sid.proc_only));
        for f in &cfg.sid.filter {
            cmdout.set("sidfilter", f);
        }
        cmdout.set_flag(if cfg.departure_ifr { "ifr" } else { "vfr" });
        cmdout.set("time", cfg.deptime.timestamp());
        cmdout.set("date", cfg.deptime.to_rfc3339_opts(SecondsFormat::Secs, true));
        Ok(())
    }

    fn cmd_destination(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        let icao = cmdin.get("icao").unwrap_or("");
        let name = cmdin.get("name").unwrap_or("");
        if !icao.is_empty() || !name.is_empty() {
            match self.controller.find_airport(icao, name) {
                Some(arpt) => {
                    self.controller.config_mut().destination = Some(arpt);
                    self.controller.invalidate_performance();
                }
                None => anyhow::bail!("destination aerodrome {icao} {name} not found"),
            }
        }
        if cmdin.is_set("ifr") {
            self.controller.config_mut().destination_ifr = true;
            self.controller.invalidate_routing();
        } else if cmdin.is_set("vfr") {
            self.controller.config_mut().destination_ifr = false;
            self.controller.invalidate_routing();
        }
        if let Some(pt) = cmdin.get_coord("star") {
            let cfg = self.controller.config_mut();
            cfg.star.coord = Some(pt);
            cfg.star.ident.clear();
            self.controller.invalidate_routing();
        } else if let Some(ident) = cmdin.get("starident") {
            let near = self
                .controller
                .config()
                .destination
                .as_ref()
                .map(|a| a.coord);
            match self.controller.find_point(ident, true, near) {
                Some((coord, id, kind)) => {
                    let cfg = self.controller.config_mut();
                    cfg.star.coord = Some(coord);
                    cfg.star.ident = id;
                    cfg.star.kind = kind;
                    self.controller.invalidate_routing();
                }
                None => anyhow::bail!("STAR point {ident} not found"),
            }
        }
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("starlimit") {
                cfg.star.limit_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("starpenalty") {
                cfg.star.penalty = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("staroffset") {
                cfg.star.offset_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("starminimum") {
                cfg.star.minimum_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("stardb") {
                cfg.star.use_db = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("staronly") {
                cfg.star.proc_only = v;
                dirty = true;
            }
            if cmdin.is_set("starfilter") {
                cfg.star.filter = cmdin
                    .get_all("starfilter")
                    .into_iter()
                    .filter(|f| !f.is_empty())
                    .map(|f| f.to_ascii_uppercase())
                    .collect();
                dirty = true;
            }
            if let Some(a) = cmdin.get("alternate1") {
                cfg.alternates[0] = a.to_ascii_uppercase();
                dirty = true;
            }
            if let Some(a) = cmdin.get("alternate2") {
                cfg.alternates[1] = a.to_ascii_uppercase();
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_routing();
            }
        }
        let cfg = self.controller.config();
        if let Some(dest) = &cfg.destination {
            cmdout.set("icao", &dest.icao);
            cmdout.set("name", &dest.name);
            cmdout.set_coord("coord", dest.coord);
        }
        match cfg.star.coord {
            Some(pt) => {
                cmdout.set_coord("star", pt);
                cmdout.set("startype", cfg.star.kind.as_str());
                cmdout.set("starident", &cfg.star.ident);
            }
            None => {
                cmdout.set("star", "");
            }
        }
        cmdout.set("starlimit", cfg.star.limit_nmi);
        cmdout.set("starpenalty", cfg.star.penalty);
        cmdout.set("staroffset", cfg.star.offset_nmi);
        cmdout.set("starminimum", cfg.star.minimum_nmi);
        cmdout.set("stardb", u8::from(cfg.star.use_db));
        cmdout.set("staronly", u8::from(cfg.star.proc_only));
        for f in &cfg.star.filter {
            cmdout.set("starfilter", f);
        }
        cmdout.set_flag(if cfg.destination_ifr { "ifr" } else { "vfr" });
        if !cfg.alternates[0].is_empty() {
            cmdout.set("alternate1", &cfg.alternates[0]);
        }
        if !cfg.alternates[1].is_empty() {
            cmdout.set("alternate2", &cfg.alternates[1]);
        }
        Ok(())
    }

    fn cmd_crossing(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        if let Some(count) = cmdin.get_u64("count") {
            self.controller.config_mut().set_crossing_count(count as usize);
            self.controller.invalidate_routing();
        }
        let index = cmdin.get_u64("index").map(|i| i as usize);
        if let Some(idx) = index {
            if idx >= self.controller.config().crossings.len() {
                anyhow::bail!("crossing index {idx} out of range");
            }
            if let Some(pt) = cmdin.get_coord("coord") {
                let c = &mut self.controller.config_mut().crossings[idx];
                c.coord = Some(pt);
                c.ident.clear();
                self.controller.invalidate_routing();
            } else if let Some(ident) = cmdin.get("ident") {
                let near = self.controller.config().departure.as_ref().map(|a| a.coord);
                match self.controller.find_point(ident, true, near) {
                    Some((coord, id, kind)) => {
                        let c = &mut self.controller.config_mut().crossings[idx];
                        c.coord = Some(coord);
                        c.ident = id;
                        c.kind = kind;
                        self.controller.invalidate_routing();
                    }
                    None => anyhow::bail!("crossing point {ident} not found"),
                }
            }
            if let Some(r) = cmdin.get_f64("radius") {
                self.controller.config_mut().crossings[idx].set_radius(r);
                self.controller.invalidate_routing();
            }
            let minlevel = cmdin.get_i64("minlevel");
            let maxlevel = cmdin.get_i64("maxlevel");
            if minlevel.is_some() || maxlevel.is_some() {
                let c = &mut self.controller.config_mut().crossings[idx];
                let lo = minlevel.map(|v| v as i32).unwrap_or(c.minlevel);
                let hi = maxlevel.map(|v| v as i32).unwrap_or(c.maxlevel);
                c.set_level(lo, hi);
                self.controller.invalidate_routing();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("count", cfg.crossings.len());
        let idx = index.unwrap_or(0);
        if let Some(c) = cfg.crossings.get(idx) {
            if let Some(pt) = c.coord {
                cmdout.set_coord("coord", pt);
            }
            cmdout.set("type", c.kind.as_str());
            cmdout.set("ident", &c.ident);
            cmdout.set("radius", c.radius_nmi);
            cmdout.set("minlevel", c.minlevel);
            cmdout.set("maxlevel", c.maxlevel);
        }
        Ok(())
    }

    fn cmd_enroute(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("dctlimit") {
                cfg.dctlimit_nmi = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("dctpenalty") {
                cfg.dctpenalty = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("dctoffset") {
                cfg.dctoffset = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("vfraspclimit") {
                cfg.vfr_airspace_limit_nmi2 = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("forceenrouteifr") {
                cfg.force_enroute_ifr = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("honourawylevels") {
                cfg.honour_awy_levels = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("honourprofilerules") {
                cfg.honour_profile_rules = v;
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_routing();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("dctlimit", cfg.dctlimit_nmi);
        cmdout.set("dctpenalty", cfg.dctpenalty);
        cmdout.set("dctoffset", cfg.dctoffset);
        cmdout.set("vfraspclimit", cfg.vfr_airspace_limit_nmi2);
        cmdout.set("forceenrouteifr", u8::from(cfg.force_enroute_ifr));
        cmdout.set("honourawylevels", u8::from(cfg.honour_awy_levels));
        cmdout.set("honourprofilerules", u8::from(cfg.honour_profile_rules));
        Ok(())
    }

    fn cmd_levels(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let base = cmdin.get_i64("base");
            let top = cmdin.get_i64("top");
            if base.is_some() || top.is_some() {
                let cfg = self.controller.config_mut();
                let b = base.map(|v| v as i32).unwrap_or(cfg.base_level);
                let t = top.map(|v| v as i32).unwrap_or(cfg.top_level);
                cfg.set_levels(b, t);
                self.controller.invalidate_performance();
            }
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("maxdescent") {
                cfg.max_descent_fpm = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("honourlevelchangetrackmiles") {
                cfg.honour_levelchange_trackmiles = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("honouropsperftrackmiles") {
                cfg.honour_opsperf_trackmiles = v;
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_performance();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("base", cfg.base_level);
        cmdout.set("top", cfg.top_level);
        cmdout.set("maxdescent", cfg.max_descent_fpm);
        cmdout.set(
            "honourlevelchangetrackmiles",
            u8::from(cfg.honour_levelchange_trackmiles),
        );
        cmdout.set(
            "honouropsperftrackmiles",
            u8::from(cfg.honour_opsperf_trackmiles),
        );
        Ok(())
    }

    fn cmd_exclude(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        if cmdin.get_bool("clear") == Some(true) {
            self.controller.config_mut().exclude_regions.clear();
            self.controller.invalidate_routing();
        }
        let mut index = cmdin.get_u64("index").map(|i| i as usize);
        {
            let base = cmdin.get_i64("base").map(|v| v as i32).unwrap_or(0);
            let top = cmdin.get_i64("top").map(|v| v as i32).unwrap_or(999);
            let awylimit = cmdin.get_f64("awylimit").unwrap_or(0.0);
            let dctlimit = cmdin.get_f64("dctlimit").unwrap_or(0.0);
            let dctoffset = cmdin.get_f64("dctoffset").unwrap_or(0.0);
            let dctscale = cmdin.get_f64("dctscale").unwrap_or(1.0);
            let mut push = |spec: ExcludeSpec, controller: &mut Controller| {
                let mut region = ExcludeRegion::new(spec);
                region.minlevel = base.min(top);
                region.maxlevel = base.max(top);
                region.awylimit_nmi = awylimit;
                region.dctlimit_nmi = dctlimit;
                region.dctoffset = dctoffset;
                region.dctscale = dctscale;
                controller.config_mut().exclude_regions.push(region);
                controller.invalidate_routing();
                controller.config().exclude_regions.len() - 1
            };
            if let Some(aspcid) = cmdin.get("aspcid") {
                let class = cmdin.get("aspctype").unwrap_or("").to_string();
                let idx = push(
                    ExcludeSpec::Airspace {
                        id: aspcid.to_ascii_uppercase(),
                        class,
                    },
                    &mut self.controller,
                );
                index.get_or_insert(idx);
            }
            if let (Some(sw), Some(ne)) = (cmdin.get_coord("sw"), cmdin.get_coord("ne")) {
                let idx = push(ExcludeSpec::Bbox(Rect::new(sw, ne)), &mut self.controller);
                index.get_or_insert(idx);
            }
        }
        let cfg = self.controller.config();
        cmdout.set("count", cfg.exclude_regions.len());
        if let Some(region) = index.and_then(|i| cfg.exclude_regions.get(i)) {
            cmdout.set("base", region.minlevel);
            cmdout.set("top", region.maxlevel);
            cmdout.set("awylimit", region.awylimit_nmi);
            cmdout.set("dctlimit", region.dctlimit_nmi);
            cmdout.set("dctoffset", region.dctoffset);
            cmdout.set("dctscale", region.dctscale);
            match &region.spec {
                ExcludeSpec::Airspace { id, class } => {
                    cmdout.set("aspcid", id);
                    cmdout.set("aspctype", class);
                }
                ExcludeSpec::Bbox(rect) => {
                    cmdout.set_coord("sw", rect.southwest());
                    cmdout.set_coord("ne", rect.northeast());
                }
            }
        }
        Ok(())
    }

    fn cmd_tfr(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_bool("enabled") {
                cfg.tfr_enabled = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get("trace") {
                cfg.trace_rules = v
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().to_ascii_uppercase())
                    .collect();
                dirty = true;
            }
            if let Some(v) = cmdin.get("disable") {
                cfg.disabled_rules = v
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().to_ascii_uppercase())
                    .collect();
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("precompgraph") {
                cfg.precomp_graph_enabled = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get("validator") {
                match ValidatorChoice::parse(v) {
                    Some(choice) => {
                        cfg.validator = choice;
                        dirty = true;
                    }
                    None => anyhow::bail!("invalid validator={v}"),
                }
            }
            if let Some(v) = cmdin.get_u64("maxlocaliterations") {
                cfg.max_local_iterations = v as u32;
            }
            if let Some(v) = cmdin.get_u64("maxremoteiterations") {
                cfg.max_remote_iterations = v as u32;
            }
            if dirty {
                self.controller.invalidate_routing();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("enabled", u8::from(cfg.tfr_enabled));
        cmdout.set("available", 1);
        cmdout.set(
            "trace",
            cfg.trace_rules.iter().cloned().collect::<Vec<_>>().join(","),
        );
        cmdout.set(
            "disable",
            cfg.disabled_rules
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        );
        cmdout.set("precompgraph", u8::from(cfg.precomp_graph_enabled));
        cmdout.set("validator", cfg.validator.as_str());
        cmdout.set("maxlocaliterations", cfg.max_local_iterations);
        cmdout.set("maxremoteiterations", cfg.max_remote_iterations);
        Ok(())
    }

    fn cmd_atmosphere(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("qnh") {
                self.controller.config_mut().set_qnh(v);
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("isa") {
                self.controller.config_mut().set_isa_offset(v);
                dirty = true;
            }
            if let Some(v) = cmdin.get_bool("wind") {
                self.controller.config_mut().wind_enabled = v;
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_performance();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("qnh", cfg.qnh_hpa);
        cmdout.set("isa", cfg.isa_offset_c);
        cmdout.set("wind", u8::from(cfg.wind_enabled));
        Ok(())
    }

    fn cmd_cruise(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_f64("rpm") {
                cfg.engine.rpm = Some(v);
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("mp") {
                cfg.engine.mp = Some(v);
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("bhp") {
                cfg.engine.bhp = Some(v);
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_performance();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("rpm", cfg.engine.rpm.unwrap_or(0.0));
        cmdout.set("mp", cfg.engine.mp.unwrap_or(0.0));
        cmdout.set("bhp", cfg.engine.bhp.unwrap_or(0.0));
        Ok(())
    }

    fn cmd_optimization(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        if let Some(v) = cmdin.get("target") {
            match OptTarget::parse(v) {
                Some(t) => self.controller.set_opt_target(t),
                None => anyhow::bail!("invalid target={v}"),
            }
        }
        cmdout.set("target", self.controller.config().opt_target.as_str());
        Ok(())
    }

    fn cmd_preferred(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        {
            let cfg = self.controller.config_mut();
            let mut dirty = false;
            if let Some(v) = cmdin.get_i64("level") {
                cfg.preferred_level = v as i32;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("penalty") {
                cfg.preferred_penalty = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("climb") {
                cfg.preferred_climb = v;
                dirty = true;
            }
            if let Some(v) = cmdin.get_f64("descent") {
                cfg.preferred_descent = v;
                dirty = true;
            }
            if dirty {
                self.controller.invalidate_performance();
            }
        }
        let cfg = self.controller.config();
        cmdout.set("level", cfg.preferred_level);
        cmdout.set("penalty", cfg.preferred_penalty);
        cmdout.set("climb", cfg.preferred_climb);
        cmdout.set("descent", cfg.preferred_descent);
        Ok(())
    }

    fn cmd_aircraft(&mut self, cmdin: &Command, cmdout: &mut Command) -> Result<()> {
        if let Some(file) = cmdin.get("file") {
            match crate::aircraft::Aircraft::load_file(PathBuf::from(file)) {
                Ok(acft) => {
                    self.controller.aircraft = acft;
                    self.controller.invalidate_performance();
                    cmdout.set("status", 1);
                }
                Err(e) => {
                    cmdout.set("status", 0);
                    anyhow::bail!("cannot load aircraft: {e}");
                }
            }
        }
        if let Some(v) = cmdin.get("registration") {
            self.controller.aircraft.callsign = v.to_ascii_uppercase();
        }
        if let Some(v) = cmdin.get("type") {
            self.controller.aircraft.icaotype = v.to_ascii_uppercase();
            self.controller.invalidate_performance();
        }
        if let Some(v) = cmdin.get("equipment") {
            self.controller.aircraft.equipment = v.to_ascii_uppercase();
        }
        if let Some(v) = cmdin.get("transponder") {
            self.controller.aircraft.transponder = v.to_ascii_uppercase();
        }
        if let Some(v) = cmdin.get("pbn") {
            self.controller.aircraft.pbn = v.to_ascii_uppercase();
        }
        let acft = &self.controller.aircraft;
        cmdout.set("registration", &acft.callsign);
        cmdout.set("type", &acft.icaotype);
        cmdout.set("equipment", &acft.equipment);
        cmdout.set("transponder", &acft.transponder);
        cmdout.set("pbn", &acft.pbn);
        Ok(())
    }

    /// Run the interface loop over a stream of request lines
    pub async fn run(&mut self, mut intake: CommandIntake) -> Result<()> {
        {
            let mut greeting = Command::new("autoroute");
            greeting.set("version", env!("CARGO_PKG_VERSION"));
            greeting.set("provider", "cfmu");
            self.write_cmd(&greeting).await?;
        }
        loop {
            if self.controller.is_running() {
                let outcome = self.controller.iterate(&mut intake).await;
                self.flush_events().await?;
                if outcome == IterOutcome::Continue {
                    // give queued commands a chance between iterations
                    while let Some(line) = intake.try_recv() {
                        if !self.dispatch(&line).await? {
                            self.controller.shutdown().await;
                            self.flush_events().await?;
                            return Ok(());
                        }
                    }
                }
                continue;
            }
            match intake.next().await {
                Some(line) => {
                    if !self.dispatch(&line).await? {
                        break;
                    }
                }
                None => break,
            }
        }
        self.controller.shutdown().await;
        self.flush_events().await?;
        Ok(())
    }
}

/// Forward stdin lines into a channel the interface can select on
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values() {
        let cmd = Command::parse("departure icao=LSZH name=Z%C3%9CRICH ifr cmdseq=17");
        assert_eq!(cmd.name(), "departure");
        assert_eq!(cmd.get("icao"), Some("LSZH"));
        assert_eq!(cmd.get("name"), Some("ZÜRICH"));
        assert!(cmd.is_set("ifr"));
        assert_eq!(cmd.get_u64("cmdseq"), Some(17));
        assert_eq!(cmd.get("missing"), None);
    }

    #[test]
    fn test_repeated_keys() {
        let cmd = Command::parse("departure sidfilter=VEBIT1G sidfilter=DEGES2G");
        assert_eq!(cmd.get_all("sidfilter"), vec!["VEBIT1G", "DEGES2G"]);
    }

    #[test]
    fn test_roundtrip_encoding() {
        let mut cmd = Command::new("log");
        cmd.set("item", "normal");
        cmd.set("text", "hello world = 100% done");
        let line = cmd.to_line();
        assert!(!line.contains("hello world"), "{line}");
        let parsed = Command::parse(&line);
        assert_eq!(parsed.get("text"), Some("hello world = 100% done"));
    }

    #[test]
    fn test_coord_parsing() {
        let cmd = Command::parse("crossing index=0 coord=47.05,10.85 radius=10");
        let pt = cmd.get_coord("coord").unwrap();
        assert!((pt.lat - 47.05).abs() < 1e-9);
        assert!((pt.lon - 10.85).abs() < 1e-9);
        assert_eq!(cmd.get_f64("radius"), Some(10.0));
    }

    #[test]
    fn test_empty_value_key() {
        let mut cmd = Command::new("departure");
        cmd.set_flag("ifr");
        assert_eq!(cmd.to_line(), "departure ifr=");
        let parsed = Command::parse(&cmd.to_line());
        assert!(parsed.is_set("ifr"));
    }
}
