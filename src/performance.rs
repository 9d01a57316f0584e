//! Cruise performance table and level-change penalty matrix.
//!
//! One row per usable cruise flight level, plus a triangular matrix of
//! climb/descent penalties between every ordered pair of rows. A sentinel
//! "ground" index one past the last row carries the initial climb from the
//! departure elevation and the final descent to the destination elevation.
//! NaN entries mean the transition is not flyable.

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::aircraft::{Aircraft, EngineParams};
use crate::atmosphere::{self, AirData};
use crate::geom::{Coord, Rect};
use crate::opsperf::{ComputeMode, OpsPerfAircraft};
use crate::wind::{GridLayer, WeatherParam, WeatherProvider, Wind};

/// Optimization target selecting the per-edge metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptTarget {
    #[default]
    Time,
    Fuel,
    Preferred,
}

impl OptTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptTarget::Time => "time",
            OptTarget::Fuel => "fuel",
            OptTarget::Preferred => "preferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time" => Some(OptTarget::Time),
            "fuel" => Some(OptTarget::Fuel),
            "preferred" => Some(OptTarget::Preferred),
            _ => None,
        }
    }
}

/// Everything the table build needs, snapshotted from the configuration
#[derive(Debug, Clone)]
pub struct PerfSpec {
    pub base_level: i32,
    pub top_level: i32,
    pub qnh: f64,
    pub isaoffs: f64,
    pub opt: OptTarget,
    pub preferred_level: i32,
    pub preferred_penalty: f64,
    pub preferred_climb: f64,
    pub preferred_descent: f64,
    pub engine: EngineParams,
    pub honour_levelchange_trackmiles: bool,
    pub honour_opsperf_trackmiles: bool,
    pub wind_enabled: bool,
    pub deptime: DateTime<Utc>,
    pub dep_elevation_ft: f64,
    pub dest_elevation_ft: f64,
    pub dep_coord: Coord,
    pub dest_coord: Coord,
}

impl Default for PerfSpec {
    fn default() -> Self {
        Self {
            base_level: 50,
            top_level: 120,
            qnh: atmosphere::STD_SEALEVEL_PRESSURE,
            isaoffs: 0.0,
            opt: OptTarget::Time,
            preferred_level: 100,
            preferred_penalty: 1.1,
            preferred_climb: 3.0,
            preferred_descent: 1.0,
            engine: EngineParams::default(),
            honour_levelchange_trackmiles: true,
            honour_opsperf_trackmiles: true,
            wind_enabled: false,
            deptime: Utc.timestamp_opt(0, 0).unwrap(),
            dep_elevation_ft: 0.0,
            dest_elevation_ft: 0.0,
            dep_coord: Coord::new(0.0, 0.0),
            dest_coord: Coord::new(0.0, 0.0),
        }
    }
}

/// One cruise row
#[derive(Debug, Clone, Default)]
pub struct Cruise {
    pub level: i32,
    pub altitude_ft: f64,
    pub density_alt_ft: f64,
    pub true_alt_ft: f64,
    pub secpernmi: f64,
    pub fuelpersec: f64,
    pub metricpernmi: f64,
    pub rpm: f64,
    pub mp_inhg: f64,
    pub windu: Option<GridLayer>,
    pub windv: Option<GridLayer>,
    pub temp: Option<GridLayer>,
}

impl Cruise {
    pub fn tas_kts(&self) -> f64 {
        3600.0 / self.secpernmi
    }

    pub fn has_wind(&self) -> bool {
        self.windu.is_some() && self.windv.is_some()
    }

    /// Wind at a point, (dir °true from, speed kts); calm when no grid bound
    pub fn wind(&self, pt: &Coord) -> Wind {
        match (&self.windu, &self.windv) {
            (Some(u), Some(v)) => match (u.sample(pt), v.sample(pt)) {
                (Some(us), Some(vs)) => Wind::from_uv(us, vs),
                _ => Wind::new(0.0, 0.0),
            },
            _ => Wind::new(0.0, 0.0),
        }
    }

    /// Temperature at a point, K; NaN when no grid bound
    pub fn temperature(&self, pt: &Coord) -> f64 {
        self.temp
            .as_ref()
            .and_then(|t| t.sample(pt))
            .unwrap_or(f64::NAN)
    }
}

/// Penalties for one ordered level transition
#[derive(Debug, Clone, Copy, Default)]
pub struct LevelChange {
    pub tracknmi: f64,
    pub timepenalty: f64,
    pub fuelpenalty: f64,
    pub metricpenalty: f64,
    pub opsperf_tracknmi: f64,
}

impl LevelChange {
    fn forbidden() -> Self {
        Self {
            tracknmi: f64::NAN,
            timepenalty: f64::NAN,
            fuelpenalty: f64::NAN,
            metricpenalty: f64::NAN,
            opsperf_tracknmi: f64::NAN,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.metricpenalty.is_nan()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Performance {
    cruise: Vec<Cruise>,
    /// (N+1) x (N+1); index N is the ground sentinel
    levelchange: Vec<Vec<LevelChange>>,
    prmsl: Option<GridLayer>,
}

impl Performance {
    pub fn is_empty(&self) -> bool {
        self.cruise.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cruise.len()
    }

    /// Index of the ground sentinel row
    pub fn ground_index(&self) -> usize {
        self.cruise.len()
    }

    pub fn cruise(&self, pi: usize) -> Option<&Cruise> {
        self.cruise.get(pi)
    }

    /// Cruise record governing the leg of a transition: the destination-side
    /// row, falling back to the source side when the destination is ground.
    pub fn cruise_pair(&self, piu: usize, piv: usize) -> Option<&Cruise> {
        self.cruise.get(piv).or_else(|| self.cruise.get(piu))
    }

    pub fn levelchange(&self, piu: usize, piv: usize) -> LevelChange {
        self.levelchange
            .get(piu)
            .and_then(|row| row.get(piv))
            .copied()
            .unwrap_or_else(LevelChange::forbidden)
    }

    pub fn prmsl(&self) -> Option<&GridLayer> {
        self.prmsl.as_ref()
    }

    /// Row index nearest to the altitude; ties go to the lower index
    pub fn find_cruise_index(&self, alt_ft: f64) -> usize {
        let mut best = 0usize;
        let mut bestdiff = f64::INFINITY;
        for (i, c) in self.cruise.iter().enumerate() {
            let diff = (c.altitude_ft - alt_ft).abs();
            if diff < bestdiff {
                bestdiff = diff;
                best = i;
            }
        }
        best
    }

    pub fn min_altitude_ft(&self) -> f64 {
        self.cruise.first().map(|c| c.altitude_ft).unwrap_or(0.0)
    }

    pub fn max_altitude_ft(&self) -> f64 {
        self.cruise.last().map(|c| c.altitude_ft).unwrap_or(0.0)
    }

    /// Build the table. An empty result means the aircraft cannot reach the
    /// base level (or the level band is empty).
    pub fn build(
        spec: &PerfSpec,
        aircraft: &Aircraft,
        opsperf: &OpsPerfAircraft,
        weather: &dyn WeatherProvider,
    ) -> Performance {
        let air = AirData::new(spec.qnh, spec.isaoffs);
        let halfgc = 0.5 * spec.dep_coord.distance_nmi(&spec.dest_coord);
        let bbox = Rect::from_point(spec.dep_coord)
            .add(spec.dest_coord)
            .oversize_nmi(100.0);
        let mut perf = Performance::default();

        let mut level = (spec.base_level + 9) / 10 * 10;
        while level <= spec.top_level {
            let pa = level as f64 * 100.0;
            if pa > aircraft.ceiling_ft() {
                break;
            }
            let climb_t = aircraft.climb().altitude_to_time(pa);
            if aircraft.climb().time_to_climbrate(climb_t) < 100.0 {
                break;
            }
            let Some(cp) = aircraft.calculate_cruise(pa, &air, &spec.engine) else {
                break;
            };
            let secpernmi = 3600.0 / cp.tas_kts;
            let fuelpersec = cp.fuel_flow / 3600.0;
            let metricpernmi = match spec.opt {
                OptTarget::Time => secpernmi,
                OptTarget::Fuel => secpernmi * fuelpersec,
                OptTarget::Preferred => spec
                    .preferred_penalty
                    .powf((level - spec.preferred_level).abs() as f64 * 0.1),
            };
            let mut row = Cruise {
                level,
                altitude_ft: pa,
                density_alt_ft: air.density_altitude(pa),
                true_alt_ft: air.true_altitude(pa),
                secpernmi,
                fuelpersec,
                metricpernmi,
                rpm: cp.rpm,
                mp_inhg: cp.mp_inhg,
                windu: None,
                windv: None,
                temp: None,
            };
            if spec.wind_enabled {
                let t = spec.deptime
                    + chrono::Duration::seconds((halfgc * secpernmi) as i64);
                let press = atmosphere::std_altitude_to_pressure(pa);
                if perf.cruise.is_empty() {
                    perf.prmsl =
                        weather.interpolate(WeatherParam::PressureMsl, &bbox, t, None);
                }
                row.windu =
                    weather.interpolate(WeatherParam::WindU, &bbox, t, Some(press));
                row.windv =
                    weather.interpolate(WeatherParam::WindV, &bbox, t, Some(press));
                row.temp =
                    weather.interpolate(WeatherParam::Temperature, &bbox, t, Some(press));
            }
            perf.cruise.push(row);
            level += 10;
            if level >= 415 {
                level += 10;
            }
        }

        let pis = perf.cruise.len();
        perf.levelchange = vec![vec![LevelChange::default(); pis + 1]; pis + 1];
        if pis == 0 {
            return perf;
        }

        let climb = aircraft.climb();
        let descent = aircraft.descent();
        let pref_metric = |dlevels: f64, climbing: bool| -> f64 {
            if climbing {
                dlevels * spec.preferred_climb
            } else {
                -(dlevels * spec.preferred_descent)
            }
        };

        for pi0 in 0..pis {
            for pi1 in 0..pis {
                if pi0 == pi1 {
                    continue;
                }
                let alt0 = perf.cruise[pi0].altitude_ft;
                let alt1 = perf.cruise[pi1].altitude_ft;
                let dst = &perf.cruise[pi1];
                let climbing = pi1 > pi0;
                let prof = if climbing { climb } else { descent };
                let (t0, t1) = if climbing {
                    (prof.altitude_to_time(alt0), prof.altitude_to_time(alt1))
                } else {
                    (prof.altitude_to_time(alt1), prof.altitude_to_time(alt0))
                };
                let tracknmi = prof.time_to_distance(t1) - prof.time_to_distance(t0);
                let mut timepenalty = (t1 - t0) - tracknmi * dst.secpernmi;
                let mut fuelpenalty = (prof.time_to_fuel(t1) - prof.time_to_fuel(t0))
                    - tracknmi * dst.secpernmi * dst.fuelpersec;
                if timepenalty.is_nan() || timepenalty < 0.0 {
                    timepenalty = 0.0;
                }
                if fuelpenalty.is_nan() || fuelpenalty < 0.0 {
                    fuelpenalty = 0.0;
                }
                let mut metricpenalty = match spec.opt {
                    OptTarget::Time => timepenalty,
                    OptTarget::Fuel => fuelpenalty,
                    OptTarget::Preferred => {
                        pref_metric((pi1 as f64 - pi0 as f64).abs(), climbing)
                    }
                };
                if metricpenalty.is_nan() {
                    metricpenalty = 0.0;
                }
                let tracknmi = if spec.honour_levelchange_trackmiles {
                    tracknmi
                } else {
                    0.0
                };
                let opsnmi = if spec.honour_opsperf_trackmiles {
                    opsperf.track_nmi(
                        alt0,
                        alt1,
                        if climbing {
                            ComputeMode::Climb
                        } else {
                            ComputeMode::Descent
                        },
                    )
                } else {
                    0.0
                };
                perf.levelchange[pi0][pi1] = LevelChange {
                    tracknmi,
                    timepenalty,
                    fuelpenalty,
                    metricpenalty,
                    opsperf_tracknmi: opsnmi,
                };
            }
        }

        // initial climb from departure elevation
        {
            let t0 = climb.altitude_to_time(air.pressure_altitude(spec.dep_elevation_ft));
            for pi in 0..pis {
                let cr = &perf.cruise[pi];
                if cr.altitude_ft < spec.dep_elevation_ft {
                    perf.levelchange[pis][pi] = LevelChange::forbidden();
                    continue;
                }
                let t1 = climb.altitude_to_time(cr.altitude_ft);
                let tracknmi = climb.time_to_distance(t1) - climb.time_to_distance(t0);
                let mut timepenalty = (t1 - t0) - tracknmi * cr.secpernmi;
                let mut fuelpenalty = (climb.time_to_fuel(t1) - climb.time_to_fuel(t0))
                    - tracknmi * cr.secpernmi * cr.fuelpersec;
                if timepenalty.is_nan() || timepenalty < 0.0 {
                    timepenalty = 0.0;
                }
                if fuelpenalty.is_nan() || fuelpenalty < 0.0 {
                    fuelpenalty = 0.0;
                }
                let metricpenalty = match spec.opt {
                    OptTarget::Time => timepenalty,
                    OptTarget::Fuel => fuelpenalty,
                    OptTarget::Preferred => pi as f64 * spec.preferred_climb,
                };
                let opsnmi = if spec.honour_opsperf_trackmiles {
                    opsperf.track_nmi(
                        spec.dep_elevation_ft + 1000.0,
                        cr.altitude_ft,
                        ComputeMode::Climb,
                    )
                } else {
                    0.0
                };
                perf.levelchange[pis][pi] = LevelChange {
                    tracknmi: if spec.honour_levelchange_trackmiles {
                        tracknmi
                    } else {
                        0.0
                    },
                    timepenalty,
                    fuelpenalty,
                    metricpenalty,
                    opsperf_tracknmi: opsnmi,
                };
            }
        }

        // final descent to destination elevation
        {
            let t0 = descent.altitude_to_time(air.pressure_altitude(spec.dest_elevation_ft));
            for pi in 0..pis {
                let cr = &perf.cruise[pi];
                if cr.altitude_ft < spec.dest_elevation_ft {
                    perf.levelchange[pi][pis] = LevelChange::forbidden();
                    continue;
                }
                let t1 = descent.altitude_to_time(cr.altitude_ft);
                let tracknmi = descent.time_to_distance(t1) - descent.time_to_distance(t0);
                let mut timepenalty = (t1 - t0) - tracknmi * cr.secpernmi;
                let mut fuelpenalty = (descent.time_to_fuel(t1) - descent.time_to_fuel(t0))
                    - tracknmi * cr.secpernmi * cr.fuelpersec;
                if timepenalty.is_nan() || timepenalty < 0.0 {
                    timepenalty = 0.0;
                }
                if fuelpenalty.is_nan() || fuelpenalty < 0.0 {
                    fuelpenalty = 0.0;
                }
                let metricpenalty = match spec.opt {
                    OptTarget::Time => timepenalty,
                    OptTarget::Fuel => fuelpenalty,
                    OptTarget::Preferred => -(pi as f64 * spec.preferred_descent),
                };
                let opsnmi = if spec.honour_opsperf_trackmiles {
                    opsperf.track_nmi(
                        cr.altitude_ft,
                        spec.dest_elevation_ft + 1000.0,
                        ComputeMode::Descent,
                    )
                } else {
                    0.0
                };
                perf.levelchange[pi][pis] = LevelChange {
                    tracknmi: if spec.honour_levelchange_trackmiles {
                        tracknmi
                    } else {
                        0.0
                    },
                    timepenalty,
                    fuelpenalty,
                    metricpenalty,
                    opsperf_tracknmi: opsnmi,
                };
            }
        }

        debug!(
            rows = perf.cruise.len(),
            base = spec.base_level,
            top = spec.top_level,
            "performance table built"
        );
        perf
    }

    /// Human-readable table for the log stream
    pub fn dump_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.is_empty() {
            return out;
        }
        let mut hdr = String::from("          ");
        let mut da = String::from("DA        ");
        let mut tas = String::from("TAS       ");
        let mut spn = String::from("s/nmi     ");
        let mut fps = String::from("Fuel/s    ");
        let mut met = String::from("Metric    ");
        for c in &self.cruise {
            hdr.push_str(&format!("{:>8}", format!("FL{:03}", c.level)));
            da.push_str(&format!("{:>8.0}", c.density_alt_ft));
            tas.push_str(&format!("{:>8.0}", c.tas_kts()));
            spn.push_str(&format!("{:>8.3}", c.secpernmi));
            fps.push_str(&format!("{:>8.5}", c.fuelpersec));
            met.push_str(&format!("{:>8.3}", c.metricpernmi));
        }
        out.push(String::from("Cruise Table"));
        out.push(hdr);
        out.push(da);
        out.push(tas);
        out.push(spn);
        out.push(fps);
        out.push(met);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opsperf::OpsPerfDb;
    use crate::wind::NullWeatherProvider;

    fn build(spec: &PerfSpec) -> Performance {
        Performance::build(
            spec,
            &Aircraft::default(),
            &OpsPerfDb::new().find_aircraft("P28R"),
            &NullWeatherProvider,
        )
    }

    #[test]
    fn test_rows_cover_level_band() {
        let spec = PerfSpec {
            base_level: 50,
            top_level: 120,
            ..PerfSpec::default()
        };
        let perf = build(&spec);
        assert!(!perf.is_empty());
        assert_eq!(perf.cruise(0).unwrap().level, 50);
        assert_eq!(perf.cruise(perf.len() - 1).unwrap().level, 120);
        assert_eq!(perf.len(), 8);
    }

    #[test]
    fn test_base_above_ceiling_is_empty() {
        let spec = PerfSpec {
            base_level: 250,
            top_level: 300,
            ..PerfSpec::default()
        };
        assert!(build(&spec).is_empty());
    }

    #[test]
    fn test_single_row_band() {
        let spec = PerfSpec {
            base_level: 100,
            top_level: 100,
            ..PerfSpec::default()
        };
        let perf = build(&spec);
        assert_eq!(perf.len(), 1);
        assert_eq!(perf.ground_index(), 1);
        // 2x2 matrix: ground <-> single row
        assert!(!perf.levelchange(1, 0).is_forbidden());
        assert!(!perf.levelchange(0, 1).is_forbidden());
    }

    #[test]
    fn test_climb_penalties_nonnegative() {
        let spec = PerfSpec {
            base_level: 50,
            top_level: 180,
            ..PerfSpec::default()
        };
        let perf = build(&spec);
        for i in 0..perf.len() {
            for j in 0..perf.len() {
                if i == j {
                    continue;
                }
                let lc = perf.levelchange(i, j);
                assert!(lc.timepenalty >= 0.0, "time {i}->{j}");
                assert!(lc.fuelpenalty >= 0.0, "fuel {i}->{j}");
                assert!(lc.tracknmi >= 0.0, "track {i}->{j}");
            }
        }
    }

    #[test]
    fn test_find_cruise_index_tie_prefers_lower() {
        let spec = PerfSpec {
            base_level: 50,
            top_level: 120,
            ..PerfSpec::default()
        };
        let perf = build(&spec);
        assert_eq!(perf.find_cruise_index(5000.0), 0);
        // halfway between FL050 and FL060
        assert_eq!(perf.find_cruise_index(5500.0), 0);
        assert_eq!(perf.find_cruise_index(12500.0), perf.len() - 1);
    }

    #[test]
    fn test_preferred_metric_grows_away_from_preferred_level() {
        let spec = PerfSpec {
            base_level: 50,
            top_level: 150,
            opt: OptTarget::Preferred,
            preferred_level: 100,
            preferred_penalty: 1.2,
            ..PerfSpec::default()
        };
        let perf = build(&spec);
        let at_pref = perf.find_cruise_index(10000.0);
        let away = perf.find_cruise_index(15000.0);
        assert!(
            perf.cruise(away).unwrap().metricpernmi > perf.cruise(at_pref).unwrap().metricpernmi
        );
    }
}
