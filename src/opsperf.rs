//! Operations-performance dataset (BADA-style rate-of-climb/descent model).
//!
//! Used only to estimate the track miles a level change consumes, which the
//! diagnostic mapper needs when a validator message constrains level changes
//! over distance. Aircraft not present in the dataset simply yield zero.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Altitude slab used when integrating a climb or descent
const SLAB_FT: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    Climb,
    Descent,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OpsPerfRow {
    pub alt_ft: f64,
    /// Rate of climb at this altitude, ft/min
    pub climb_rocd_fpm: f64,
    /// Rate of descent at this altitude, ft/min (positive)
    pub descent_rocd_fpm: f64,
    pub tas_kts: f64,
}

#[derive(Debug, Clone, Default)]
pub struct OpsPerfAircraft {
    rows: Vec<OpsPerfRow>,
}

impl OpsPerfAircraft {
    pub fn new(mut rows: Vec<OpsPerfRow>) -> Self {
        rows.sort_by(|a, b| a.alt_ft.total_cmp(&b.alt_ft));
        Self { rows }
    }

    pub fn is_valid(&self) -> bool {
        self.rows.len() >= 2
    }

    fn sample(&self, alt_ft: f64, f: impl Fn(&OpsPerfRow) -> f64) -> f64 {
        let xs: Vec<f64> = self.rows.iter().map(|r| r.alt_ft).collect();
        let ys: Vec<f64> = self.rows.iter().map(&f).collect();
        crate::aircraft::ClimbDescent::interp(&xs, &ys, alt_ft)
    }

    /// Rate of climb/descent and TAS at the given altitude
    pub fn compute(&self, alt_ft: f64, mode: ComputeMode) -> Option<(f64, f64)> {
        if !self.is_valid() {
            return None;
        }
        let rocd = match mode {
            ComputeMode::Climb => self.sample(alt_ft, |r| r.climb_rocd_fpm),
            ComputeMode::Descent => self.sample(alt_ft, |r| r.descent_rocd_fpm),
        };
        if rocd <= 0.0 {
            return None;
        }
        Some((rocd, self.sample(alt_ft, |r| r.tas_kts)))
    }

    /// Track miles consumed by a level change, integrated in 500 ft slabs
    pub fn track_nmi(&self, from_alt_ft: f64, to_alt_ft: f64, mode: ComputeMode) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        let (lo, hi) = if from_alt_ft <= to_alt_ft {
            (from_alt_ft, to_alt_ft)
        } else {
            (to_alt_ft, from_alt_ft)
        };
        let mut track = 0.0;
        let mut alt = match mode {
            ComputeMode::Climb => lo,
            ComputeMode::Descent => hi,
        };
        loop {
            let remaining = match mode {
                ComputeMode::Climb => hi - alt,
                ComputeMode::Descent => alt - lo,
            };
            if remaining <= 0.0 {
                break;
            }
            let step = remaining.min(SLAB_FT);
            if let Some((rocd, tas)) = self.compute(alt, mode) {
                track += (step / rocd) / 60.0 * tas;
            }
            match mode {
                ComputeMode::Climb => alt += step,
                ComputeMode::Descent => alt -= step,
            }
        }
        track
    }
}

#[derive(Debug, Deserialize)]
struct DatasetRow {
    icaotype: String,
    alt_ft: f64,
    climb_rocd_fpm: f64,
    descent_rocd_fpm: f64,
    tas_kts: f64,
}

/// The full dataset keyed by ICAO aircraft type
#[derive(Debug, Clone, Default)]
pub struct OpsPerfDb {
    aircraft: HashMap<String, OpsPerfAircraft>,
}

impl OpsPerfDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn insert(&mut self, icaotype: &str, acft: OpsPerfAircraft) {
        self.aircraft.insert(icaotype.to_ascii_uppercase(), acft);
    }

    /// Load `opsperf.csv` from the auxiliary database directory. A missing
    /// file leaves the dataset empty and level-change track miles at zero.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Self {
        let path = dir.as_ref().join("opsperf.csv");
        let mut db = Self::new();
        let rdr = match csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open {}", path.display()))
        {
            Ok(r) => r,
            Err(e) => {
                warn!("OpsPerf dataset unavailable: {e}");
                return db;
            }
        };
        let mut grouped: HashMap<String, Vec<OpsPerfRow>> = HashMap::new();
        let mut rdr = rdr;
        for rec in rdr.deserialize::<DatasetRow>() {
            match rec {
                Ok(row) => grouped
                    .entry(row.icaotype.to_ascii_uppercase())
                    .or_default()
                    .push(OpsPerfRow {
                        alt_ft: row.alt_ft,
                        climb_rocd_fpm: row.climb_rocd_fpm,
                        descent_rocd_fpm: row.descent_rocd_fpm,
                        tas_kts: row.tas_kts,
                    }),
                Err(e) => warn!("Skipping malformed opsperf row: {e}"),
            }
        }
        for (icaotype, rows) in grouped {
            db.aircraft.insert(icaotype, OpsPerfAircraft::new(rows));
        }
        debug!("Loaded opsperf dataset: {} aircraft types", db.aircraft.len());
        db
    }

    pub fn find_aircraft(&self, icaotype: &str) -> OpsPerfAircraft {
        self.aircraft
            .get(&icaotype.to_ascii_uppercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OpsPerfAircraft {
        OpsPerfAircraft::new(vec![
            OpsPerfRow {
                alt_ft: 0.0,
                climb_rocd_fpm: 1000.0,
                descent_rocd_fpm: 800.0,
                tas_kts: 120.0,
            },
            OpsPerfRow {
                alt_ft: 20000.0,
                climb_rocd_fpm: 300.0,
                descent_rocd_fpm: 800.0,
                tas_kts: 160.0,
            },
        ])
    }

    #[test]
    fn test_unknown_type_is_zero() {
        let db = OpsPerfDb::new();
        let acft = db.find_aircraft("A320");
        assert!(!acft.is_valid());
        assert_eq!(acft.track_nmi(1000.0, 11000.0, ComputeMode::Climb), 0.0);
    }

    #[test]
    fn test_track_miles_increase_with_altitude_band() {
        let acft = sample();
        let short = acft.track_nmi(5000.0, 7000.0, ComputeMode::Climb);
        let long = acft.track_nmi(5000.0, 15000.0, ComputeMode::Climb);
        assert!(short > 0.0);
        assert!(long > short * 3.0);
    }

    #[test]
    fn test_descent_track_miles() {
        let acft = sample();
        let d = acft.track_nmi(15000.0, 5000.0, ComputeMode::Descent);
        // 10000 ft at 800 fpm and ~140 kts is in the 25-35 nmi range
        assert!((20.0..40.0).contains(&d), "track {d}");
    }
}
