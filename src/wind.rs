//! Atmospheric data interface and wind math.
//!
//! Gridded layers come from a [`WeatherProvider`]; the engine samples U/V
//! wind, temperature and mean-sea-level pressure bilinearly. The provider
//! shipped here reads pre-interpolated JSON grids from a `gfs/` directory;
//! the null provider reports no layers, which downgrades every query to
//! calm wind / ISA temperature.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::geom::{Coord, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherParam {
    WindU,
    WindV,
    Temperature,
    PressureMsl,
}

/// A regular lat/lon grid of one parameter at one time/pressure surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLayer {
    pub param: WeatherParam,
    pub bbox: Rect,
    /// Pressure surface, hPa; None for surface parameters
    pub pressure_hpa: Option<f64>,
    pub effective: DateTime<Utc>,
    pub nx: usize,
    pub ny: usize,
    /// Row-major, south-to-north, west-to-east
    pub data: Vec<f32>,
}

impl GridLayer {
    /// Bilinear sample; None outside the grid
    pub fn sample(&self, pt: &Coord) -> Option<f64> {
        if self.nx < 2 || self.ny < 2 || self.data.len() != self.nx * self.ny {
            return None;
        }
        let fx = (pt.lon - self.bbox.west) / (self.bbox.east - self.bbox.west)
            * (self.nx - 1) as f64;
        let fy = (pt.lat - self.bbox.south) / (self.bbox.north - self.bbox.south)
            * (self.ny - 1) as f64;
        if fx < 0.0 || fy < 0.0 || fx > (self.nx - 1) as f64 || fy > (self.ny - 1) as f64 {
            return None;
        }
        let x0 = (fx as usize).min(self.nx - 2);
        let y0 = (fy as usize).min(self.ny - 2);
        let dx = fx - x0 as f64;
        let dy = fy - y0 as f64;
        let at = |x: usize, y: usize| self.data[y * self.nx + x] as f64;
        let v0 = at(x0, y0) * (1.0 - dx) + at(x0 + 1, y0) * dx;
        let v1 = at(x0, y0 + 1) * (1.0 - dx) + at(x0 + 1, y0 + 1) * dx;
        Some(v0 * (1.0 - dy) + v1 * dy)
    }
}

/// Read access to gridded atmospheric data
pub trait WeatherProvider: Send + Sync {
    /// Layer interpolated to the given time and pressure surface over bbox
    fn interpolate(
        &self,
        param: WeatherParam,
        bbox: &Rect,
        time: DateTime<Utc>,
        pressure_hpa: Option<f64>,
    ) -> Option<GridLayer>;

    /// Number of layers available for the parameter
    fn layer_count(&self, param: WeatherParam) -> usize;
}

/// Provider with no data; every sample is calm/ISA
#[derive(Debug, Default, Clone)]
pub struct NullWeatherProvider;

impl WeatherProvider for NullWeatherProvider {
    fn interpolate(
        &self,
        _param: WeatherParam,
        _bbox: &Rect,
        _time: DateTime<Utc>,
        _pressure_hpa: Option<f64>,
    ) -> Option<GridLayer> {
        None
    }

    fn layer_count(&self, _param: WeatherParam) -> usize {
        0
    }
}

/// Provider backed by JSON layer files in a directory
#[derive(Debug, Default, Clone)]
pub struct FileWeatherProvider {
    layers: Vec<GridLayer>,
}

impl FileWeatherProvider {
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().join("gfs");
        let mut layers = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => {
                info!("No weather directory at {}", dir.display());
                return Self { layers };
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<Vec<GridLayer>>(&s).map_err(Into::into))
            {
                Ok(mut l) => layers.append(&mut l),
                Err(e) => warn!("Skipping weather file {}: {e}", path.display()),
            }
        }
        info!("Loaded {} weather layers from {}", layers.len(), dir.display());
        Self { layers }
    }
}

impl WeatherProvider for FileWeatherProvider {
    fn interpolate(
        &self,
        param: WeatherParam,
        bbox: &Rect,
        time: DateTime<Utc>,
        pressure_hpa: Option<f64>,
    ) -> Option<GridLayer> {
        // nearest layer in time, then in pressure
        self.layers
            .iter()
            .filter(|l| l.param == param && l.bbox.intersects(bbox))
            .filter(|l| match (pressure_hpa, l.pressure_hpa) {
                (Some(want), Some(have)) => (want - have).abs() < 150.0,
                (None, None) => true,
                _ => false,
            })
            .min_by_key(|l| (l.effective - time).num_seconds().abs())
            .cloned()
    }

    fn layer_count(&self, param: WeatherParam) -> usize {
        self.layers.iter().filter(|l| l.param == param).count()
    }
}

/// Wind vector plus the triangle solution for a given course and TAS
#[derive(Debug, Clone, Copy, Default)]
pub struct Wind {
    dir_deg: f64,
    speed_kts: f64,
    hdg_deg: f64,
    gs_kts: f64,
}

impl Wind {
    /// Wind from U (east) and V (north) components in m/s
    pub fn from_uv(u_ms: f64, v_ms: f64) -> Self {
        let speed = (u_ms * u_ms + v_ms * v_ms).sqrt() * 1.9438445;
        // meteorological convention: direction the wind blows FROM
        let dir = (u_ms.atan2(v_ms).to_degrees() + 180.0 + 360.0) % 360.0;
        Self {
            dir_deg: dir,
            speed_kts: speed,
            hdg_deg: 0.0,
            gs_kts: 0.0,
        }
    }

    pub fn new(dir_deg: f64, speed_kts: f64) -> Self {
        Self {
            dir_deg,
            speed_kts,
            hdg_deg: 0.0,
            gs_kts: 0.0,
        }
    }

    pub fn dir_deg(&self) -> f64 {
        self.dir_deg
    }

    pub fn speed_kts(&self) -> f64 {
        self.speed_kts
    }

    /// Solve the wind triangle for a desired true course at the given TAS
    pub fn set_crs_tas(&mut self, crs_deg: f64, tas_kts: f64) {
        let crs = crs_deg.to_radians();
        // wind TO direction
        let wto = (self.dir_deg + 180.0).to_radians();
        let wx = self.speed_kts * wto.sin();
        let wy = self.speed_kts * wto.cos();
        // crosswind/headwind relative to course
        let cross = wx * crs.cos() - wy * crs.sin();
        let along = wx * crs.sin() + wy * crs.cos();
        if tas_kts <= cross.abs() {
            // unflyable wind; fall back to zero groundspeed
            self.hdg_deg = crs_deg;
            self.gs_kts = 0.0;
            return;
        }
        let correction = (cross / tas_kts).asin();
        self.hdg_deg = (crs_deg - correction.to_degrees() + 360.0) % 360.0;
        self.gs_kts = tas_kts * correction.cos() + along;
    }

    pub fn hdg_deg(&self) -> f64 {
        self.hdg_deg
    }

    pub fn gs_kts(&self) -> f64 {
        self.gs_kts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_grid_sample_center() {
        let layer = GridLayer {
            param: WeatherParam::Temperature,
            bbox: Rect::new(Coord::new(45.0, 7.0), Coord::new(48.0, 10.0)),
            pressure_hpa: Some(700.0),
            effective: Utc::now(),
            nx: 2,
            ny: 2,
            data: vec![270.0, 272.0, 274.0, 276.0],
        };
        let v = layer.sample(&Coord::new(46.5, 8.5)).unwrap();
        assert_relative_eq!(v, 273.0, epsilon = 0.01);
        assert!(layer.sample(&Coord::new(40.0, 8.5)).is_none());
    }

    #[test]
    fn test_headwind_reduces_groundspeed() {
        // wind from due north, flying due north
        let mut w = Wind::new(0.0, 20.0);
        w.set_crs_tas(0.0, 120.0);
        assert_relative_eq!(w.gs_kts(), 100.0, epsilon = 0.1);
        assert_relative_eq!(w.hdg_deg(), 0.0, epsilon = 0.1);
    }

    #[test]
    fn test_crosswind_correction() {
        // wind from the west, flying north: crab left, slight gs loss
        let mut w = Wind::new(270.0, 30.0);
        w.set_crs_tas(0.0, 120.0);
        assert!(w.hdg_deg() > 340.0 && w.hdg_deg() < 360.0);
        assert!(w.gs_kts() < 120.0 && w.gs_kts() > 110.0);
    }

    #[test]
    fn test_from_uv_direction() {
        // pure westerly flow: u > 0, wind FROM 270
        let w = Wind::from_uv(10.0, 0.0);
        assert_relative_eq!(w.dir_deg(), 270.0, epsilon = 0.1);
        assert_relative_eq!(w.speed_kts(), 19.44, epsilon = 0.1);
    }
}
