//! Aircraft performance model.
//!
//! Models are loaded from TOML files carrying the FPL identity block, a
//! cruise table over density altitude and climb/descent profiles sampled
//! over altitude. The profiles are integrated once into cumulative
//! time/distance/fuel curves so the performance table can query them
//! cheaply in both directions.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::atmosphere::AirData;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub alt_ft: f64,
    /// Rate of climb or descent, ft/min, always positive
    pub rate_fpm: f64,
    pub tas_kts: f64,
    pub fuel_flow: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CruisePoint {
    pub da_ft: f64,
    pub tas_kts: f64,
    pub fuel_flow: f64,
    #[serde(default)]
    pub rpm: f64,
    #[serde(default)]
    pub mp_inhg: f64,
}

/// Engine knobs applied on top of the cruise table
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineParams {
    pub bhp: Option<f64>,
    pub rpm: Option<f64>,
    pub mp: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct CruisePerf {
    pub tas_kts: f64,
    pub fuel_flow: f64,
    pub rpm: f64,
    pub mp_inhg: f64,
}

/// Climb or descent curve integrated over time
#[derive(Debug, Clone)]
pub struct ClimbDescent {
    /// Parallel sample arrays, ascending altitude
    alt_ft: Vec<f64>,
    time_sec: Vec<f64>,
    dist_nmi: Vec<f64>,
    fuel: Vec<f64>,
    rate_fpm: Vec<f64>,
    ceiling_ft: f64,
}

impl ClimbDescent {
    fn integrate(points: &[ProfilePoint], ceiling_ft: f64) -> Result<Self> {
        if points.len() < 2 {
            bail!("climb/descent profile needs at least two sample points");
        }
        let mut alt = Vec::with_capacity(points.len());
        let mut time = Vec::with_capacity(points.len());
        let mut dist = Vec::with_capacity(points.len());
        let mut fuel = Vec::with_capacity(points.len());
        let mut rate = Vec::with_capacity(points.len());
        let (mut t, mut d, mut f) = (0.0f64, 0.0f64, 0.0f64);
        for (i, p) in points.iter().enumerate() {
            if i > 0 {
                let prev = &points[i - 1];
                let dalt = p.alt_ft - prev.alt_ft;
                if dalt <= 0.0 {
                    bail!("profile altitudes must be strictly increasing");
                }
                let avg_rate = 0.5 * (p.rate_fpm + prev.rate_fpm);
                if avg_rate <= 0.0 {
                    bail!("profile rate must stay positive");
                }
                let dt = dalt / avg_rate * 60.0;
                t += dt;
                d += 0.5 * (p.tas_kts + prev.tas_kts) * dt / 3600.0;
                f += 0.5 * (p.fuel_flow + prev.fuel_flow) * dt / 3600.0;
            }
            alt.push(p.alt_ft);
            time.push(t);
            dist.push(d);
            fuel.push(f);
            rate.push(p.rate_fpm);
        }
        Ok(Self {
            alt_ft: alt,
            time_sec: time,
            dist_nmi: dist,
            fuel,
            rate_fpm: rate,
            ceiling_ft,
        })
    }

    pub fn ceiling_ft(&self) -> f64 {
        self.ceiling_ft
    }

    pub(crate) fn interp(xs: &[f64], ys: &[f64], x: f64) -> f64 {
        if xs.is_empty() {
            return 0.0;
        }
        if x <= xs[0] {
            return ys[0];
        }
        if x >= xs[xs.len() - 1] {
            return ys[ys.len() - 1];
        }
        for w in 0..xs.len() - 1 {
            if x >= xs[w] && x <= xs[w + 1] {
                let f = (x - xs[w]) / (xs[w + 1] - xs[w]);
                return ys[w] + f * (ys[w + 1] - ys[w]);
            }
        }
        ys[ys.len() - 1]
    }

    /// Seconds from profile start to reach the given altitude
    pub fn altitude_to_time(&self, alt_ft: f64) -> f64 {
        Self::interp(&self.alt_ft, &self.time_sec, alt_ft)
    }

    pub fn time_to_distance(&self, t_sec: f64) -> f64 {
        Self::interp(&self.time_sec, &self.dist_nmi, t_sec)
    }

    pub fn time_to_fuel(&self, t_sec: f64) -> f64 {
        Self::interp(&self.time_sec, &self.fuel, t_sec)
    }

    pub fn time_to_climbrate(&self, t_sec: f64) -> f64 {
        Self::interp(&self.time_sec, &self.rate_fpm, t_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityBlock {
    #[serde(default)]
    callsign: String,
    icaotype: String,
    #[serde(default = "default_wake")]
    wake: char,
    #[serde(default = "default_equipment")]
    equipment: String,
    #[serde(default = "default_transponder")]
    transponder: String,
    #[serde(default)]
    pbn: String,
}

fn default_wake() -> char {
    'L'
}
fn default_equipment() -> String {
    "SDFGRY".into()
}
fn default_transponder() -> String {
    "S".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CruiseBlock {
    #[serde(default = "default_rated_bhp")]
    rated_bhp: f64,
    points: Vec<CruisePoint>,
}

fn default_rated_bhp() -> f64 {
    200.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LimitsBlock {
    ceiling_ft: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileBlock {
    points: Vec<ProfilePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AircraftFile {
    identity: IdentityBlock,
    limits: LimitsBlock,
    cruise: CruiseBlock,
    climb: ProfileBlock,
    descent: ProfileBlock,
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub callsign: String,
    pub icaotype: String,
    pub wake: char,
    pub equipment: String,
    pub transponder: String,
    pub pbn: String,
    rated_bhp: f64,
    cruise: Vec<CruisePoint>,
    climb: ClimbDescent,
    descent: ClimbDescent,
}

impl Aircraft {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read aircraft file {}", path.as_ref().display()))?;
        Self::load_str(&text)
    }

    pub fn load_str(text: &str) -> Result<Self> {
        let file: AircraftFile = toml::from_str(text).context("Malformed aircraft model")?;
        Self::from_file(file)
    }

    fn from_file(file: AircraftFile) -> Result<Self> {
        if file.cruise.points.len() < 2 {
            bail!("cruise table needs at least two sample points");
        }
        let ceiling = file.limits.ceiling_ft;
        Ok(Self {
            callsign: file.identity.callsign,
            icaotype: file.identity.icaotype,
            wake: file.identity.wake,
            equipment: file.identity.equipment,
            transponder: file.identity.transponder,
            pbn: file.identity.pbn,
            rated_bhp: file.cruise.rated_bhp,
            cruise: file.cruise.points,
            climb: ClimbDescent::integrate(&file.climb.points, ceiling)?,
            descent: ClimbDescent::integrate(&file.descent.points, ceiling)?,
        })
    }

    pub fn climb(&self) -> &ClimbDescent {
        &self.climb
    }

    pub fn descent(&self) -> &ClimbDescent {
        &self.descent
    }

    pub fn ceiling_ft(&self) -> f64 {
        self.climb.ceiling_ft()
    }

    pub fn has_pbn(&self) -> bool {
        !self.pbn.is_empty()
    }

    /// Cruise TAS and fuel flow at the given pressure altitude under the
    /// configured atmosphere, with optional engine derating.
    pub fn calculate_cruise(
        &self,
        pressure_alt_ft: f64,
        air: &AirData,
        engine: &EngineParams,
    ) -> Option<CruisePerf> {
        if pressure_alt_ft > self.ceiling_ft() {
            return None;
        }
        let da = air.density_altitude(pressure_alt_ft);
        let tas = interp_cruise(&self.cruise, da, |p| p.tas_kts);
        let ff = interp_cruise(&self.cruise, da, |p| p.fuel_flow);
        let rpm = interp_cruise(&self.cruise, da, |p| p.rpm);
        let mp = interp_cruise(&self.cruise, da, |p| p.mp_inhg);
        if tas <= 0.0 {
            return None;
        }
        let (tas, ff) = match engine.bhp {
            Some(bhp) if bhp > 0.0 && self.rated_bhp > 0.0 => {
                let frac = (bhp / self.rated_bhp).clamp(0.4, 1.1);
                (tas * frac.cbrt(), ff * frac)
            }
            _ => (tas, ff),
        };
        Some(CruisePerf {
            tas_kts: tas,
            fuel_flow: ff,
            rpm: engine.rpm.unwrap_or(rpm),
            mp_inhg: engine.mp.unwrap_or(mp),
        })
    }
}

fn interp_cruise(points: &[CruisePoint], da: f64, f: impl Fn(&CruisePoint) -> f64) -> f64 {
    let xs: Vec<f64> = points.iter().map(|p| p.da_ft).collect();
    let ys: Vec<f64> = points.iter().map(&f).collect();
    ClimbDescent::interp(&xs, &ys, da)
}

impl Default for Aircraft {
    /// A generic normally-aspirated four-seater, used until a model is loaded
    fn default() -> Self {
        let climb: Vec<ProfilePoint> = (0..=10)
            .map(|i| {
                let alt = i as f64 * 2000.0;
                ProfilePoint {
                    alt_ft: alt,
                    rate_fpm: (1100.0 - alt * 0.05).max(80.0),
                    tas_kts: 95.0 + alt * 0.001,
                    fuel_flow: 16.0 - alt * 0.0002,
                }
            })
            .collect();
        let descent: Vec<ProfilePoint> = (0..=10)
            .map(|i| {
                let alt = i as f64 * 2000.0;
                ProfilePoint {
                    alt_ft: alt,
                    rate_fpm: 700.0,
                    tas_kts: 130.0,
                    fuel_flow: 7.0,
                }
            })
            .collect();
        let cruise = vec![
            CruisePoint {
                da_ft: 0.0,
                tas_kts: 125.0,
                fuel_flow: 12.0,
                rpm: 2400.0,
                mp_inhg: 24.0,
            },
            CruisePoint {
                da_ft: 8000.0,
                tas_kts: 135.0,
                fuel_flow: 10.5,
                rpm: 2400.0,
                mp_inhg: 21.0,
            },
            CruisePoint {
                da_ft: 14000.0,
                tas_kts: 138.0,
                fuel_flow: 9.5,
                rpm: 2400.0,
                mp_inhg: 17.0,
            },
            CruisePoint {
                da_ft: 20000.0,
                tas_kts: 132.0,
                fuel_flow: 9.0,
                rpm: 2400.0,
                mp_inhg: 14.0,
            },
        ];
        Self::from_file(AircraftFile {
            identity: IdentityBlock {
                callsign: String::new(),
                icaotype: "P28R".into(),
                wake: 'L',
                equipment: "SDFGRY".into(),
                transponder: "S".into(),
                pbn: "B2".into(),
            },
            limits: LimitsBlock {
                ceiling_ft: 20000.0,
            },
            cruise: CruiseBlock {
                rated_bhp: 200.0,
                points: cruise,
            },
            climb: ProfileBlock { points: climb },
            descent: ProfileBlock { points: descent },
        })
        .expect("builtin aircraft model is well-formed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atmosphere::STD_SEALEVEL_PRESSURE;

    #[test]
    fn test_default_model_cruise() {
        let acft = Aircraft::default();
        let air = AirData::new(STD_SEALEVEL_PRESSURE, 0.0);
        let perf = acft
            .calculate_cruise(10000.0, &air, &EngineParams::default())
            .unwrap();
        assert!(perf.tas_kts > 100.0 && perf.tas_kts < 150.0);
        assert!(perf.fuel_flow > 5.0 && perf.fuel_flow < 20.0);
    }

    #[test]
    fn test_cruise_above_ceiling() {
        let acft = Aircraft::default();
        let air = AirData::new(STD_SEALEVEL_PRESSURE, 0.0);
        assert!(
            acft.calculate_cruise(25000.0, &air, &EngineParams::default())
                .is_none()
        );
    }

    #[test]
    fn test_climb_curve_monotonic() {
        let acft = Aircraft::default();
        let t1 = acft.climb().altitude_to_time(5000.0);
        let t2 = acft.climb().altitude_to_time(10000.0);
        assert!(t2 > t1 && t1 > 0.0);
        assert!(acft.climb().time_to_distance(t2) > acft.climb().time_to_distance(t1));
        assert!(acft.climb().time_to_fuel(t2) > acft.climb().time_to_fuel(t1));
    }

    #[test]
    fn test_derated_engine_burns_less() {
        let acft = Aircraft::default();
        let air = AirData::new(STD_SEALEVEL_PRESSURE, 0.0);
        let full = acft
            .calculate_cruise(8000.0, &air, &EngineParams::default())
            .unwrap();
        let derated = acft
            .calculate_cruise(
                8000.0,
                &air,
                &EngineParams {
                    bhp: Some(130.0),
                    rpm: None,
                    mp: None,
                },
            )
            .unwrap();
        assert!(derated.fuel_flow < full.fuel_flow);
        assert!(derated.tas_kts < full.tas_kts);
    }

    #[test]
    fn test_toml_roundtrip() {
        let text = r#"
[identity]
callsign = "HBPBX"
icaotype = "P28R"

[limits]
ceiling_ft = 18000.0

[cruise]
rated_bhp = 200.0
points = [
  { da_ft = 0.0, tas_kts = 120.0, fuel_flow = 11.0 },
  { da_ft = 12000.0, tas_kts = 132.0, fuel_flow = 9.5 },
]

[climb]
points = [
  { alt_ft = 0.0, rate_fpm = 900.0, tas_kts = 90.0, fuel_flow = 15.0 },
  { alt_ft = 18000.0, rate_fpm = 150.0, tas_kts = 105.0, fuel_flow = 12.0 },
]

[descent]
points = [
  { alt_ft = 0.0, rate_fpm = 600.0, tas_kts = 130.0, fuel_flow = 6.0 },
  { alt_ft = 18000.0, rate_fpm = 600.0, tas_kts = 130.0, fuel_flow = 6.0 },
]
"#;
        let acft = Aircraft::load_str(text).unwrap();
        assert_eq!(acft.callsign, "HBPBX");
        assert_eq!(acft.ceiling_ft(), 18000.0);
    }
}
