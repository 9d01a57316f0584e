//! ICAO standard atmosphere with QNH and temperature-offset corrections.

/// Sea-level standard pressure, hPa
pub const STD_SEALEVEL_PRESSURE: f64 = 1013.25;

/// Sea-level standard temperature, K
pub const STD_SEALEVEL_TEMP: f64 = 288.15;

/// Temperature lapse rate, K per ft
pub const LAPSE_RATE_PER_FT: f64 = 0.0019812;

const EXPONENT: f64 = 5.25588;

/// ISA temperature at the given pressure altitude, K
pub fn isa_temperature(alt_ft: f64) -> f64 {
    (STD_SEALEVEL_TEMP - LAPSE_RATE_PER_FT * alt_ft).max(216.65)
}

/// Standard-atmosphere pressure at the given altitude, hPa
pub fn std_altitude_to_pressure(alt_ft: f64) -> f64 {
    STD_SEALEVEL_PRESSURE * (1.0 - LAPSE_RATE_PER_FT * alt_ft / STD_SEALEVEL_TEMP).powf(EXPONENT)
}

/// Standard-atmosphere altitude for the given pressure, ft
pub fn std_pressure_to_altitude(press_hpa: f64) -> f64 {
    STD_SEALEVEL_TEMP / LAPSE_RATE_PER_FT
        * (1.0 - (press_hpa / STD_SEALEVEL_PRESSURE).powf(1.0 / EXPONENT))
}

/// Air column state for one QNH / ISA-offset setting
#[derive(Debug, Clone, Copy)]
pub struct AirData {
    qnh: f64,
    isaoffs: f64,
}

impl AirData {
    pub fn new(qnh: f64, isaoffs: f64) -> Self {
        Self { qnh, isaoffs }
    }

    pub fn qnh(&self) -> f64 {
        self.qnh
    }

    pub fn isa_offset(&self) -> f64 {
        self.isaoffs
    }

    /// Density altitude for a pressure altitude, ft.
    /// Warm air raises it by roughly 118.8 ft per kelvin of ISA deviation.
    pub fn density_altitude(&self, pressure_alt_ft: f64) -> f64 {
        pressure_alt_ft + 118.8 * self.isaoffs
    }

    /// True altitude for a pressure altitude under this QNH / temperature, ft
    pub fn true_altitude(&self, pressure_alt_ft: f64) -> f64 {
        let qnh_corr = (self.qnh - STD_SEALEVEL_PRESSURE) * 27.3;
        let indicated = pressure_alt_ft + qnh_corr;
        indicated * (1.0 + self.isaoffs / STD_SEALEVEL_TEMP)
    }

    /// Pressure altitude whose corrected true altitude equals `true_alt_ft`
    pub fn pressure_altitude(&self, true_alt_ft: f64) -> f64 {
        let indicated = true_alt_ft / (1.0 + self.isaoffs / STD_SEALEVEL_TEMP);
        indicated - (self.qnh - STD_SEALEVEL_PRESSURE) * 27.3
    }

    /// Outside air temperature at a pressure altitude, K
    pub fn temperature(&self, pressure_alt_ft: f64) -> f64 {
        isa_temperature(pressure_alt_ft) + self.isaoffs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_std_pressure_sealevel() {
        assert_relative_eq!(std_altitude_to_pressure(0.0), 1013.25, epsilon = 0.01);
    }

    #[test]
    fn test_std_pressure_fl180() {
        // ISA pressure at 18000 ft is close to 500 hPa
        let p = std_altitude_to_pressure(18000.0);
        assert!((495.0..510.0).contains(&p), "pressure {p}");
    }

    #[test]
    fn test_pressure_altitude_roundtrip() {
        let alt = std_pressure_to_altitude(std_altitude_to_pressure(12345.0));
        assert_relative_eq!(alt, 12345.0, epsilon = 1.0);
    }

    #[test]
    fn test_airdata_std_is_identity() {
        let ad = AirData::new(STD_SEALEVEL_PRESSURE, 0.0);
        assert_relative_eq!(ad.true_altitude(10000.0), 10000.0, epsilon = 0.01);
        assert_relative_eq!(ad.density_altitude(10000.0), 10000.0, epsilon = 0.01);
    }

    #[test]
    fn test_airdata_low_qnh_lowers_true_altitude() {
        let ad = AirData::new(983.25, 0.0);
        assert!(ad.true_altitude(10000.0) < 10000.0 - 700.0);
        let pa = ad.pressure_altitude(ad.true_altitude(10000.0));
        assert_relative_eq!(pa, 10000.0, epsilon = 1.0);
    }
}
