//! Precompute an airway graph tile for the configured bounding box.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::controller::Controller;
use crate::fplan::WaypointKind;
use crate::graph::{Edge, EdgeKind, Vertex};
use crate::navdata::NavDatabase;
use crate::precomp::GraphTile;

pub fn handle_precompute(
    controller: &Controller,
    db: &dyn NavDatabase,
    out_path: &Path,
) -> Result<()> {
    let Some(bbox) = controller.config().bbox() else {
        bail!("departure and destination must be set to derive the tile bounding box");
    };
    let bbox = bbox.oversize_nmi(200.0);
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut index: HashMap<(String, i64, i64), u32> = HashMap::new();
    let mut edges: Vec<(u32, Edge)> = Vec::new();
    let mut vertex_for = |vertices: &mut Vec<Vertex>, ident: &str, coord: crate::geom::Coord| {
        let key = (
            ident.to_ascii_uppercase(),
            (coord.lat * 10000.0).round() as i64,
            (coord.lon * 10000.0).round() as i64,
        );
        *index.entry(key).or_insert_with(|| {
            vertices.push(Vertex {
                ident: ident.to_string(),
                name: ident.to_string(),
                coord,
                kind: WaypointKind::Intersection,
                elevation_ft: 0,
            });
            (vertices.len() - 1) as u32
        })
    };
    for seg in db.airways_in(&bbox) {
        let u = vertex_for(&mut vertices, &seg.from_ident, seg.from_coord);
        let v = vertex_for(&mut vertices, &seg.to_ident, seg.to_coord);
        if u == v {
            continue;
        }
        let dist = seg.from_coord.distance_nmi(&seg.to_coord);
        for (a, b) in [(u, v), (v, u)] {
            edges.push((
                a,
                Edge {
                    to: b as usize,
                    ident: seg.airway.clone(),
                    lower_fl: seg.base_fl,
                    upper_fl: seg.top_fl,
                    kind: EdgeKind::Airway,
                    dist_nmi: dist,
                    metric: dist,
                },
            ));
        }
    }
    let tile = GraphTile {
        bbox,
        vertices,
        edges,
    };
    tile.save(out_path)
        .with_context(|| format!("Cannot write graph tile {}", out_path.display()))?;
    info!(
        "Precomputed graph tile: {} vertices, {} edges",
        tile.vertices.len(),
        tile.edges.len()
    );
    Ok(())
}
