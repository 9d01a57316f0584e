use geo::{Contains, Intersects};
use serde::{Deserialize, Serialize};

/// Mean earth radius in nautical miles
pub const EARTH_RADIUS_NMI: f64 = 3440.065;

/// Metres per nautical mile
pub const NMI_TO_M: f64 = 1852.0;

pub const FT_TO_M: f64 = 0.3048;

/// Geographic coordinate, degrees. Positive north / east.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in nautical miles (haversine)
    pub fn distance_nmi(&self, other: &Coord) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat * 0.5).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon * 0.5).sin().powi(2);
        2.0 * a.sqrt().asin() * EARTH_RADIUS_NMI
    }

    /// Initial true course towards `other`, degrees 0..360
    pub fn true_course_deg(&self, other: &Coord) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlon = (other.lon - self.lon).to_radians();
        let y = dlon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
        let crs = y.atan2(x).to_degrees();
        (crs + 360.0) % 360.0
    }

    /// Point at the given course and distance along the great circle
    pub fn offset_nmi(&self, course_deg: f64, dist_nmi: f64) -> Coord {
        let d = dist_nmi / EARTH_RADIUS_NMI;
        let crs = course_deg.to_radians();
        let lat1 = self.lat.to_radians();
        let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * crs.cos()).asin();
        let lon2 = self.lon.to_radians()
            + (crs.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());
        Coord {
            lat: lat2.to_degrees(),
            lon: ((lon2.to_degrees() + 540.0) % 360.0) - 180.0,
        }
    }

    /// Midpoint approximation, good enough for weather sampling
    pub fn halfway(&self, other: &Coord) -> Coord {
        Coord {
            lat: 0.5 * (self.lat + other.lat),
            lon: 0.5 * (self.lon + other.lon),
        }
    }

    fn to_geo(self) -> geo::Coord<f64> {
        geo::Coord {
            x: self.lon,
            y: self.lat,
        }
    }
}

/// Axis-aligned geographic rectangle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Rect {
    pub fn new(sw: Coord, ne: Coord) -> Self {
        Self {
            south: sw.lat.min(ne.lat),
            west: sw.lon.min(ne.lon),
            north: sw.lat.max(ne.lat),
            east: sw.lon.max(ne.lon),
        }
    }

    pub fn from_point(pt: Coord) -> Self {
        Self {
            south: pt.lat,
            west: pt.lon,
            north: pt.lat,
            east: pt.lon,
        }
    }

    pub fn southwest(&self) -> Coord {
        Coord::new(self.south, self.west)
    }

    pub fn northeast(&self) -> Coord {
        Coord::new(self.north, self.east)
    }

    pub fn add(&self, pt: Coord) -> Rect {
        Rect {
            south: self.south.min(pt.lat),
            west: self.west.min(pt.lon),
            north: self.north.max(pt.lat),
            east: self.east.max(pt.lon),
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            south: self.south.min(other.south),
            west: self.west.min(other.west),
            north: self.north.max(other.north),
            east: self.east.max(other.east),
        }
    }

    pub fn contains(&self, pt: &Coord) -> bool {
        pt.lat >= self.south && pt.lat <= self.north && pt.lon >= self.west && pt.lon <= self.east
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.south <= other.north
            && self.north >= other.south
            && self.west <= other.east
            && self.east >= other.west
    }

    /// Grow the rectangle by the given distance on all sides
    pub fn oversize_nmi(&self, nmi: f64) -> Rect {
        let dlat = nmi / 60.0;
        let coslat = self
            .south
            .abs()
            .max(self.north.abs())
            .to_radians()
            .cos()
            .max(0.05);
        let dlon = dlat / coslat;
        Rect {
            south: self.south - dlat,
            west: self.west - dlon,
            north: self.north + dlat,
            east: self.east + dlon,
        }
    }

    /// Does the segment a-b touch this rectangle (coarse bbox test)
    pub fn intersects_segment(&self, a: &Coord, b: &Coord) -> bool {
        Rect::new(*a, *b).intersects(self)
    }
}

/// Airspace boundary: one or more rings with winding-number containment
/// and segment intersection tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaPolygon {
    rings: Vec<Vec<Coord>>,
}

impl AreaPolygon {
    pub fn new(rings: Vec<Vec<Coord>>) -> Self {
        Self { rings }
    }

    pub fn from_ring(ring: Vec<Coord>) -> Self {
        Self { rings: vec![ring] }
    }

    pub fn is_empty(&self) -> bool {
        self.rings.iter().all(|r| r.len() < 3)
    }

    pub fn bbox(&self) -> Option<Rect> {
        let mut it = self.rings.iter().flatten();
        let first = it.next()?;
        let mut r = Rect::from_point(*first);
        for pt in it {
            r = r.add(*pt);
        }
        Some(r)
    }

    fn to_geo(&self) -> geo::MultiPolygon<f64> {
        geo::MultiPolygon::new(
            self.rings
                .iter()
                .filter(|r| r.len() >= 3)
                .map(|r| {
                    let ls: geo::LineString<f64> =
                        r.iter().map(|c| c.to_geo()).collect::<Vec<_>>().into();
                    geo::Polygon::new(ls, vec![])
                })
                .collect(),
        )
    }

    /// Winding-number containment test
    pub fn contains(&self, pt: &Coord) -> bool {
        self.to_geo().contains(&geo::Point::new(pt.lon, pt.lat))
    }

    /// Does the segment a-b cross the boundary
    pub fn intersects_segment(&self, a: &Coord, b: &Coord) -> bool {
        let line = geo::Line::new(a.to_geo(), b.to_geo());
        self.to_geo().intersects(&line)
    }

    /// Geodesic area in square nautical miles
    pub fn area_nmi2(&self) -> f64 {
        use geo::ChamberlainDuquetteArea;
        self.to_geo().chamberlain_duquette_unsigned_area() as f64 / (NMI_TO_M * NMI_TO_M)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_zurich_milan() {
        let lszh = Coord::new(47.458056, 8.548056);
        let limc = Coord::new(45.63, 8.723056);
        let d = lszh.distance_nmi(&limc);
        // published great-circle distance is about 110 nmi
        assert!((105.0..115.0).contains(&d), "distance {d}");
    }

    #[test]
    fn test_course_north() {
        let a = Coord::new(46.0, 8.0);
        let b = Coord::new(47.0, 8.0);
        assert_relative_eq!(a.true_course_deg(&b), 0.0, epsilon = 0.1);
    }

    #[test]
    fn test_offset_roundtrip() {
        let a = Coord::new(47.0, 8.5);
        let b = a.offset_nmi(135.0, 25.0);
        assert_relative_eq!(a.distance_nmi(&b), 25.0, epsilon = 0.05);
        assert_relative_eq!(a.true_course_deg(&b), 135.0, epsilon = 0.5);
    }

    #[test]
    fn test_rect_oversize() {
        let r = Rect::new(Coord::new(46.0, 8.0), Coord::new(47.0, 9.0)).oversize_nmi(60.0);
        assert!(r.south < 45.1 && r.north > 47.9);
        assert!(r.contains(&Coord::new(45.5, 8.5)));
    }

    #[test]
    fn test_polygon_contains() {
        let poly = AreaPolygon::from_ring(vec![
            Coord::new(46.0, 8.0),
            Coord::new(46.0, 9.0),
            Coord::new(47.0, 9.0),
            Coord::new(47.0, 8.0),
        ]);
        assert!(poly.contains(&Coord::new(46.5, 8.5)));
        assert!(!poly.contains(&Coord::new(45.5, 8.5)));
        // segment crossing through
        assert!(poly.intersects_segment(&Coord::new(45.5, 8.5), &Coord::new(47.5, 8.5)));
        assert!(!poly.intersects_segment(&Coord::new(45.0, 7.0), &Coord::new(45.0, 10.0)));
        assert!(poly.area_nmi2() > 1000.0);
    }
}
