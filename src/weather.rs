//! Route weather binder.
//!
//! Populates per-waypoint wind, temperature, QFF and true altitude from the
//! grids bound to the active performance rows, then recomputes leg timings
//! and fuel with ground-speed correction. Zero-wind totals are kept
//! alongside for the EET fields. Five minutes of taxi pad the off-block and
//! on-block times.

use tracing::trace;

use crate::fplan::FplRoute;
use crate::performance::Performance;
use crate::wind::Wind;

const TAXI_SEC: i64 = 5 * 60;

pub fn bind_route(
    route: &mut FplRoute,
    perf: &Performance,
    wind_enabled: bool,
    qnh: f64,
    isaoffs: f64,
) {
    route.route_fuel_usg = 0.0;
    route.zerowind_fuel_usg = 0.0;
    let mut rttime = 0.0f64;
    let mut rtzwtime = 0.0f64;
    let mut tm = route.time_offblock_unix + TAXI_SEC;
    let ground = perf.ground_index();
    let n = route.len();
    let mut prevpi = ground;

    for i in 0..n {
        let enroute = i > 0 && i + 1 < n;
        let pi = if enroute {
            perf.find_cruise_index(route.waypoints[i].altitude_ft as f64)
        } else {
            ground
        };
        {
            let coord = route.waypoints[i].coord;
            let qff = perf
                .prmsl()
                .and_then(|l| l.sample(&coord))
                .map(|p| p * 0.01)
                .unwrap_or(qnh);
            let wpt = &mut route.waypoints[i];
            wpt.qff_hpa = qff;
            if let Some(cruise) = perf.cruise_pair(prevpi, pi) {
                let wind = cruise.wind(&coord);
                wpt.winddir_deg = wind.dir_deg();
                wpt.windspeed_kts = wind.speed_kts();
                let temp = cruise.temperature(&coord);
                if temp.is_nan() {
                    wpt.oat_k = None;
                    wpt.isaoffset_k = isaoffs;
                } else {
                    wpt.oat_k = Some(temp);
                }
            } else {
                wpt.isaoffset_k = isaoffs;
            }
        }
        if i > 0 {
            // climb/descent markers on the leg into this waypoint
            if prevpi == ground || (prevpi < pi && pi != ground) {
                route.waypoints[i - 1].climb = true;
            }
            if pi == ground || (pi < prevpi && prevpi != ground) {
                route.waypoints[i - 1].descent = true;
            }
            let mut tmadd = 0.0;
            let mut tmaddzw = 0.0;
            if pi != ground || prevpi != ground {
                let cruise = perf
                    .cruise_pair(prevpi, pi)
                    .expect("one side of the transition is a cruise row");
                let from = route.waypoints[i - 1].coord;
                let to = route.waypoints[i].coord;
                let dist = from.distance_nmi(&to);
                let tt = from.true_course_deg(&to);
                let mut wdist = dist;
                {
                    let prev = &mut route.waypoints[i - 1];
                    prev.dist_nmi = dist;
                    prev.truetrack_deg = tt;
                    prev.trueheading_deg = tt;
                    prev.tas_kts = cruise.tas_kts();
                    prev.truealt_ft = cruise.true_alt_ft;
                    if i > 1 {
                        prev.rpm = cruise.rpm;
                        prev.mp_inhg = cruise.mp_inhg;
                    }
                }
                if wind_enabled {
                    let prev = &route.waypoints[i - 1];
                    let mut wind = Wind::new(
                        0.5 * (prev.winddir_deg + route.waypoints[i].winddir_deg),
                        0.5 * (prev.windspeed_kts + route.waypoints[i].windspeed_kts),
                    );
                    wind.set_crs_tas(tt, cruise.tas_kts());
                    route.waypoints[i - 1].trueheading_deg = wind.hdg_deg();
                    if wind.gs_kts() >= 0.1 {
                        wdist *= cruise.tas_kts() / wind.gs_kts();
                    }
                    trace!(
                        leg = i,
                        tt,
                        hdg = wind.hdg_deg(),
                        gs = wind.gs_kts(),
                        "leg wind solution"
                    );
                }
                tmadd = wdist * cruise.secpernmi;
                tmaddzw = dist * cruise.secpernmi;
                route.route_fuel_usg += tmadd * cruise.fuelpersec;
                route.zerowind_fuel_usg += tmaddzw * cruise.fuelpersec;
                let lc = perf.levelchange(prevpi, pi);
                if !lc.is_forbidden() {
                    tmadd += lc.timepenalty;
                    tmaddzw += lc.timepenalty;
                    route.route_fuel_usg += lc.fuelpenalty;
                    route.zerowind_fuel_usg += lc.fuelpenalty;
                }
            }
            tm += tmadd.round() as i64;
            rttime += tmadd;
            rtzwtime += tmaddzw;
        }
        let wpt = &mut route.waypoints[i];
        wpt.time_unix = tm;
        wpt.flighttime_sec = rttime.round().max(0.0) as u32;
        wpt.fuel_usg = route.route_fuel_usg;
        prevpi = pi;
    }
    route.route_time_sec = rttime;
    route.zerowind_time_sec = rtzwtime;
    route.time_onblock_unix = tm + TAXI_SEC;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::Aircraft;
    use crate::fplan::FplWaypoint;
    use crate::geom::Coord;
    use crate::opsperf::OpsPerfDb;
    use crate::performance::PerfSpec;
    use crate::wind::NullWeatherProvider;

    fn perf() -> Performance {
        Performance::build(
            &PerfSpec {
                base_level: 50,
                top_level: 120,
                ..PerfSpec::default()
            },
            &Aircraft::default(),
            &OpsPerfDb::new().find_aircraft("P28R"),
            &NullWeatherProvider,
        )
    }

    fn route() -> FplRoute {
        let mut r = FplRoute::new();
        for (ident, lat, lon, alt) in [
            ("LSZH", 47.458, 8.548, 1400),
            ("VEBIT", 47.0, 8.7, 10000),
            ("LIMC", 45.63, 8.72, 800),
        ] {
            r.waypoints.push(FplWaypoint {
                icao: ident.into(),
                coord: Coord::new(lat, lon),
                altitude_ft: alt,
                ifr: true,
                ..FplWaypoint::default()
            });
        }
        r.time_offblock_unix = 1_700_000_000;
        r
    }

    #[test]
    fn test_timings_accumulate() {
        let perf = perf();
        let mut r = route();
        bind_route(&mut r, &perf, false, 1013.25, 0.0);
        assert!(r.route_time_sec > 0.0);
        assert_eq!(r.route_time_sec, r.zerowind_time_sec);
        assert!(r.route_fuel_usg > 0.0);
        // taxi pads
        assert_eq!(r.waypoints[0].time_unix, 1_700_000_000 + 300);
        assert_eq!(
            r.time_onblock_unix,
            r.waypoints.last().unwrap().time_unix + 300
        );
        // times increase along the route
        assert!(r.waypoints[1].time_unix > r.waypoints[0].time_unix);
        assert!(r.waypoints[2].time_unix > r.waypoints[1].time_unix);
    }

    #[test]
    fn test_climb_descent_markers() {
        let perf = perf();
        let mut r = route();
        bind_route(&mut r, &perf, false, 1013.25, 0.0);
        assert!(r.waypoints[0].climb);
        assert!(r.waypoints[1].descent);
    }

    #[test]
    fn test_qff_falls_back_to_qnh() {
        let perf = perf();
        let mut r = route();
        bind_route(&mut r, &perf, false, 1020.0, 0.0);
        assert_eq!(r.waypoints[0].qff_hpa, 1020.0);
    }
}
