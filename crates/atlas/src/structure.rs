use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default color for structures without a usable color entry (light gray)
pub const DEFAULT_COLOR: [u8; 3] = [0xD3, 0xD3, 0xD3];

/// A string-keyed description record, one per structure (column name -> value)
pub type StructureRow = BTreeMap<String, String>;

/// Immutable description of one anatomical structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureRecord {
    pub id: i32,
    /// Capitalized so that name-based orderings are stable
    pub name: String,
    pub parent_id: i32,
    /// Ancestor ids from the root down to (and including) this structure
    pub ancestry_path: Vec<i32>,
    pub depth: i32,
    pub graph_order: i32,
    pub color: [u8; 3],
    /// Passthrough descriptive fields (acronym, ontology id, ...), kept opaque
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StructureRecord {
    /// Synthesized record for an id absent from the description table
    pub fn unknown(id: i32) -> Self {
        Self {
            id,
            name: format!("Unknown_id_{id}"),
            parent_id: -1,
            ancestry_path: Vec::new(),
            depth: -1,
            graph_order: -1,
            color: DEFAULT_COLOR,
            metadata: BTreeMap::new(),
        }
    }

    /// Build a record from one description row. Missing integer fields default
    /// to -1, missing strings to "Unknown", a missing color to light gray and
    /// a missing ancestry path to empty.
    pub fn from_row(row: &StructureRow) -> Self {
        let id = int_field(row, "id");
        let name = capitalize(&string_field(row, "name"));

        let color = row
            .get("color_hex_triplet")
            .map(|v| clean(v))
            .and_then(|v| parse_hex_color(&v))
            .unwrap_or(DEFAULT_COLOR);

        let ancestry_path = row
            .get("structure_id_path")
            .map(|v| parse_ancestry_path(id, &clean(v)))
            .unwrap_or_default();

        let consumed = [
            "id",
            "name",
            "parent_structure_id",
            "depth",
            "graph_order",
            "color_hex_triplet",
            "structure_id_path",
        ];
        let metadata = row
            .iter()
            .filter(|(key, _)| !consumed.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), clean(value)))
            .collect();

        Self {
            id,
            name,
            parent_id: int_field(row, "parent_structure_id"),
            ancestry_path,
            depth: int_field(row, "depth"),
            graph_order: int_field(row, "graph_order"),
            color,
            metadata,
        }
    }

    /// Color as an RRGGBB hex triplet, e.g. "D3D3D3"
    pub fn color_hex(&self) -> String {
        format!(
            "{:02X}{:02X}{:02X}",
            self.color[0], self.color[1], self.color[2]
        )
    }
}

/// The parsed structure description table
#[derive(Debug, Clone, Default)]
pub struct StructureTable {
    records: Vec<StructureRecord>,
}

impl StructureTable {
    /// Parse an ordered sequence of description rows, one record per row
    pub fn parse_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = StructureRow>,
    {
        let records = rows
            .into_iter()
            .map(|row| {
                let record = StructureRecord::from_row(&row);
                if record.id == -1 {
                    warn!(name = %record.name, "structure row without a parseable id");
                }
                record
            })
            .collect();
        Self { records }
    }

    pub fn records(&self) -> &[StructureRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StructureRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn clean(value: &str) -> String {
    value.trim().replace('"', "")
}

fn int_field(row: &StructureRow, key: &str) -> i32 {
    row.get(key)
        .and_then(|v| clean(v).parse::<i32>().ok())
        .unwrap_or(-1)
}

fn string_field(row: &StructureRow, key: &str) -> String {
    row.get(key)
        .map(|v| clean(v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Parse a "/997/8/567/" style ancestry path. Segments that fail to parse are
/// dropped with a warning rather than failing the whole record.
fn parse_ancestry_path(id: i32, path: &str) -> Vec<i32> {
    if path.is_empty() || path == "Unknown" {
        return Vec::new();
    }
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .filter_map(|segment| match segment.parse::<i32>() {
            Ok(ancestor) => Some(ancestor),
            Err(_) => {
                warn!(id, segment, "unparseable ancestry path segment dropped");
                None
            }
        })
        .collect()
}

pub(crate) fn parse_hex_color(value: &str) -> Option<[u8; 3]> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r, g, b])
}
