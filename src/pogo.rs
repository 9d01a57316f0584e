//! POGO aerodrome pairs.
//!
//! Some aerodrome pairs must be filed as a single DCT at a fixed level,
//! bypassing route search entirely. The pairs and their levels are data,
//! loaded from a TOML table; a default table ships with the binary.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_TABLE: &str = include_str!("../data/pogo.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct PogoGroup {
    pub name: String,
    pub airports: Vec<String>,
    /// Filed cruise altitude for pairs inside this group, ft
    pub altitude_ft: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PogoTable {
    #[serde(rename = "group", default)]
    pub groups: Vec<PogoGroup>,
}

impl PogoTable {
    pub fn builtin() -> Self {
        toml::from_str(DEFAULT_TABLE).expect("builtin POGO table is well-formed")
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read POGO table {}", path.as_ref().display()))?;
        toml::from_str(&text).context("Malformed POGO table")
    }

    /// Fixed altitude when the pair must be filed as a single DCT
    pub fn lookup(&self, dep_icao: &str, dest_icao: &str) -> Option<i32> {
        if dep_icao.eq_ignore_ascii_case(dest_icao) {
            return None;
        }
        self.groups
            .iter()
            .find(|g| {
                let has = |icao: &str| g.airports.iter().any(|a| a.eq_ignore_ascii_case(icao));
                has(dep_icao) && has(dest_icao)
            })
            .map(|g| g.altitude_ft)
    }

    pub fn is_pogo(&self, dep_icao: &str, dest_icao: &str) -> bool {
        self.lookup(dep_icao, dest_icao).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_paris_group() {
        let table = PogoTable::builtin();
        assert!(table.is_pogo("LFPG", "LFPO"));
        assert!(table.is_pogo("lfpo", "lfpg"));
        assert!(!table.is_pogo("LFPG", "LFPG"));
        assert!(!table.is_pogo("LFPG", "LSZH"));
        assert!(table.lookup("LFPG", "LFPB").unwrap() > 0);
    }

    #[test]
    fn test_custom_table() {
        let table: PogoTable = toml::from_str(
            r#"
[[group]]
name = "test"
airports = ["AAAA", "BBBB"]
altitude_ft = 5000
"#,
        )
        .unwrap();
        assert_eq!(table.lookup("AAAA", "BBBB"), Some(5000));
    }
}
