//! Precomputed graph tile persistence.
//!
//! A tile carries the airway part of the routing graph for a bounding box
//! so repeated runs over the same area skip the overlay work. The on-disk
//! format is a magic + version header followed by a gzip-compressed
//! bincode body; unknown versions are rejected.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geom::Rect;
use crate::graph::{Edge, Vertex};

const MAGIC: &[u8; 4] = b"ARGT";
const VERSION: u8 = 2;

/// Serializable slice of a routing graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphTile {
    pub bbox: Rect,
    pub vertices: Vec<Vertex>,
    /// (source vertex index, edge) pairs
    pub edges: Vec<(u32, Edge)>,
}

impl GraphTile {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let body = bincode::serialize(self).context("Failed to serialize graph tile")?;
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&body)?;
        enc.finish()?;
        info!(
            "Wrote graph tile {} ({} vertices, {} edges)",
            path.display(),
            self.vertices.len(),
            self.edges.len()
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut header = [0u8; 5];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            bail!("{} is not a graph tile", path.display());
        }
        if header[4] != VERSION {
            bail!(
                "{}: unsupported graph tile version {}",
                path.display(),
                header[4]
            );
        }
        let mut body = Vec::new();
        GzDecoder::new(file).read_to_end(&mut body)?;
        bincode::deserialize(&body).context("Corrupt graph tile body")
    }

    /// Tile is usable when it covers the requested box
    pub fn covers(&self, bbox: &Rect) -> bool {
        self.bbox.south <= bbox.south
            && self.bbox.north >= bbox.north
            && self.bbox.west <= bbox.west
            && self.bbox.east >= bbox.east
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fplan::WaypointKind;
    use crate::geom::Coord;
    use crate::graph::EdgeKind;

    fn sample_tile() -> GraphTile {
        GraphTile {
            bbox: Rect::new(Coord::new(45.0, 7.0), Coord::new(48.0, 10.0)),
            vertices: vec![
                Vertex {
                    ident: "VEBIT".into(),
                    name: "VEBIT".into(),
                    coord: Coord::new(47.0, 8.7),
                    kind: WaypointKind::Intersection,
                    elevation_ft: 0,
                },
                Vertex {
                    ident: "SOPER".into(),
                    name: "SOPER".into(),
                    coord: Coord::new(46.3, 8.8),
                    kind: WaypointKind::Intersection,
                    elevation_ft: 0,
                },
            ],
            edges: vec![(
                0,
                Edge {
                    to: 1,
                    ident: "UL613".into(),
                    lower_fl: 100,
                    upper_fl: 460,
                    kind: EdgeKind::Airway,
                    dist_nmi: 40.0,
                    metric: 40.0,
                },
            )],
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.bin");
        let tile = sample_tile();
        tile.save(&path).unwrap();
        let loaded = GraphTile::load(&path).unwrap();
        assert_eq!(loaded.vertices.len(), 2);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.edges[0].1.ident, "UL613");
    }

    #[test]
    fn test_reject_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"not a tile at all").unwrap();
        assert!(GraphTile::load(&path).is_err());
    }

    #[test]
    fn test_covers() {
        let tile = sample_tile();
        assert!(tile.covers(&Rect::new(Coord::new(46.0, 8.0), Coord::new(47.0, 9.0))));
        assert!(!tile.covers(&Rect::new(Coord::new(44.0, 8.0), Coord::new(47.0, 9.0))));
    }
}
