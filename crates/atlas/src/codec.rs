use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    dataset::{AtlasDataset, DatasetMetadata, RegionInstance},
    error::Result,
    structure::{parse_hex_color, StructureRecord, DEFAULT_COLOR},
    types::{RegionMeasurement, RegionPolygon},
};

/// Name of the single document entry inside the archived variant
pub const ARCHIVE_ENTRY: &str = "dataset.json";

/// Encode a region's geometry as a length-prefixed binary blob wrapped in
/// base64, so it can live inside a text document
pub fn encode_polygon(polygon: &RegionPolygon) -> Result<String> {
    let bytes = bincode::encode_to_vec(polygon, bincode::config::standard())?;
    Ok(BASE64.encode(bytes))
}

/// Reverse of [`encode_polygon`]
pub fn decode_polygon(encoded: &str) -> Result<RegionPolygon> {
    let bytes = BASE64.decode(encoded)?;
    let (polygon, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(polygon)
}

/// The six named numeric fields persisted with every region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct RegionMeasurementDocument {
    area: f64,
    total_intensity: f64,
    mean_intensity: f64,
    std_intensity: f64,
    min_intensity: f64,
    max_intensity: f64,
}

impl From<&RegionMeasurement> for RegionMeasurementDocument {
    fn from(m: &RegionMeasurement) -> Self {
        Self {
            area: m.area,
            total_intensity: m.total_intensity,
            mean_intensity: m.mean_intensity,
            std_intensity: m.std_intensity,
            min_intensity: m.min_intensity,
            max_intensity: m.max_intensity,
        }
    }
}

impl From<RegionMeasurementDocument> for RegionMeasurement {
    fn from(d: RegionMeasurementDocument) -> Self {
        Self {
            area: d.area,
            volume: 0.0,
            total_intensity: d.total_intensity,
            mean_intensity: d.mean_intensity,
            std_intensity: d.std_intensity,
            min_intensity: d.min_intensity,
            max_intensity: d.max_intensity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegionDocument {
    slice: u32,
    /// Base64-wrapped geometry blob
    roi: String,
    /// Absent for regions whose measurement was never computed; loading such
    /// a region yields an unset measurement rather than a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    measurements: Option<RegionMeasurementDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StructureDocument {
    id: i32,
    name: String,
    parent_structure_id: i32,
    depth: i32,
    graph_order: i32,
    #[serde(default)]
    structure_id_path: Vec<i32>,
    color_hex_triplet: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    rois: BTreeMap<u32, RegionDocument>,
    /// The pooled per-structure measurement
    #[serde(default)]
    measurements: RegionMeasurement,
}

/// The self-describing persisted form of a whole dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDocument {
    metadata: DatasetMetadata,
    #[serde(default)]
    structures: BTreeMap<i32, StructureDocument>,
    #[serde(default)]
    selection_profiles: BTreeMap<String, BTreeSet<i32>>,
}

impl DatasetDocument {
    /// Snapshot a dataset into its document form
    pub fn from_dataset(dataset: &AtlasDataset) -> Result<Self> {
        let mut structures = BTreeMap::new();
        for entry in dataset.entries() {
            let record = entry.record();
            let mut rois = BTreeMap::new();
            for region in entry.regions() {
                rois.insert(
                    region.slice,
                    RegionDocument {
                        slice: region.slice,
                        roi: encode_polygon(&region.polygon)?,
                        measurements: region.measurement.as_ref().map(Into::into),
                    },
                );
            }
            structures.insert(
                record.id,
                StructureDocument {
                    id: record.id,
                    name: record.name.clone(),
                    parent_structure_id: record.parent_id,
                    depth: record.depth,
                    graph_order: record.graph_order,
                    structure_id_path: record.ancestry_path.clone(),
                    color_hex_triplet: record.color_hex(),
                    metadata: record.metadata.clone(),
                    rois,
                    measurements: entry.aggregate(),
                },
            );
        }

        Ok(Self {
            metadata: dataset.metadata(),
            structures,
            selection_profiles: dataset.profiles_snapshot(),
        })
    }

    /// Materialize the document as an in-memory dataset.
    ///
    /// The name index of the returned dataset is NOT rebuilt here; callers
    /// must invoke [`AtlasDataset::rebuild_name_index`] before any name-based
    /// lookup, like after any other bulk mutation.
    pub fn into_dataset(self) -> Result<AtlasDataset> {
        let dataset = AtlasDataset::new();
        dataset.set_metadata(self.metadata);
        dataset.restore_profiles(self.selection_profiles);

        for (id, document) in self.structures {
            let record = StructureRecord {
                id,
                name: document.name,
                parent_id: document.parent_structure_id,
                ancestry_path: document.structure_id_path,
                depth: document.depth,
                graph_order: document.graph_order,
                color: parse_hex_color(&document.color_hex_triplet).unwrap_or(DEFAULT_COLOR),
                metadata: document.metadata,
            };
            let entry = dataset.insert(record);
            for (slice, region) in document.rois {
                entry.put_region(RegionInstance {
                    slice,
                    polygon: decode_polygon(&region.roi)?,
                    measurement: region.measurements.map(Into::into),
                });
            }
            entry.set_aggregate(document.measurements);
        }

        Ok(dataset)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Serialize the dataset as a loose JSON document
pub fn save_json(dataset: &AtlasDataset, path: impl AsRef<Path>) -> Result<()> {
    let json = DatasetDocument::from_dataset(dataset)?.to_json_string()?;
    std::fs::write(&path, json)?;
    info!(path = %path.as_ref().display(), "dataset saved as JSON document");
    Ok(())
}

/// Deserialize a dataset from a loose JSON document. The name index is left
/// stale; rebuild it before name-based lookup.
pub fn load_json(path: impl AsRef<Path>) -> Result<AtlasDataset> {
    let json = std::fs::read_to_string(&path)?;
    let dataset = DatasetDocument::from_json_str(&json)?.into_dataset()?;
    info!(path = %path.as_ref().display(), "dataset loaded from JSON document");
    Ok(dataset)
}

/// Serialize the dataset as a zip archive holding the JSON document as its
/// single `dataset.json` entry
pub fn save_zip(dataset: &AtlasDataset, path: impl AsRef<Path>) -> Result<()> {
    let json = DatasetDocument::from_dataset(dataset)?.to_json_string()?;

    let file = File::create(&path)?;
    let mut writer = zip::ZipWriter::new(file);
    writer.start_file(
        ARCHIVE_ENTRY,
        zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated),
    )?;
    writer.write_all(json.as_bytes())?;
    writer.finish()?;
    info!(path = %path.as_ref().display(), "dataset saved as zip archive");
    Ok(())
}

/// Reverse of [`save_zip`]; decodes to the same dataset as the loose variant.
/// The name index is left stale; rebuild it before name-based lookup.
pub fn load_zip(path: impl AsRef<Path>) -> Result<AtlasDataset> {
    let file = File::open(&path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut json = String::new();
    archive.by_name(ARCHIVE_ENTRY)?.read_to_string(&mut json)?;

    let dataset = DatasetDocument::from_json_str(&json)?.into_dataset()?;
    info!(path = %path.as_ref().display(), "dataset loaded from zip archive");
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegionShape;

    fn sample_polygon() -> RegionPolygon {
        RegionPolygon::new(vec![
        RegionShape::new(
            vec![[0.0, 0.0], [5.0, 0.0], [5.0, 4.0], [0.0, 4.0]],
            vec![vec![[1.0, 1.0], [1.0, 2.0], [2.0, 2.0], [2.0, 1.0]]],
        ),
        RegionShape::new(vec![[7.0, 7.0], [8.0, 7.0], [8.0, 8.0], [7.0, 8.0]], vec![]),
        ])
    }

    fn sample_dataset() -> AtlasDataset {
        let dataset = AtlasDataset::new();
        let record = StructureRecord {
            id: 7,
            name: "Thalamus".to_string(),
            parent_id: 8,
            ancestry_path: vec![997, 8, 7],
            depth: 2,
            graph_order: 3,
            color: [0xB0, 0xF0, 0xFF],
            metadata: [("acronym".to_string(), "TH".to_string())].into_iter().collect(),
        };
        let entry = dataset.insert(record);
        entry.put_region(RegionInstance {
            slice: 4,
            polygon: sample_polygon(),
            measurement: Some(RegionMeasurement {
                area: 20.0,
                volume: 0.0,
                total_intensity: 440.0,
                mean_intensity: 22.0,
                std_intensity: 3.5,
                min_intensity: 11.0,
                max_intensity: 39.0,
            }),
        });
        dataset.rebuild_structure_aggregates();
        dataset.save_profile("favorites", [7].into_iter().collect());
        dataset
    }

    fn assert_datasets_equal(lhs: &AtlasDataset, rhs: &AtlasDataset) {
        assert_eq!(lhs.structure_ids(), rhs.structure_ids());
        for id in lhs.structure_ids() {
            let a = lhs.get(id).expect("Entry should exist");
            let b = rhs.get(id).expect("Entry should exist");
            assert_eq!(a.record(), b.record());
            assert_eq!(a.regions(), b.regions());
            assert_eq!(a.aggregate(), b.aggregate());
        }
        assert_eq!(lhs.profiles_snapshot(), rhs.profiles_snapshot());
        assert_eq!(lhs.metadata(), rhs.metadata());
    }

    #[test]
    fn test_polygon_blob_round_trip() {
        let polygon = sample_polygon();
        let encoded = encode_polygon(&polygon).expect("Should encode");
        let decoded = decode_polygon(&encoded).expect("Should decode");

        assert_eq!(decoded, polygon);
    }

    #[test]
    fn test_document_round_trip() {
        let dataset = sample_dataset();
        let json = DatasetDocument::from_dataset(&dataset)
            .expect("Should snapshot")
            .to_json_string()
            .expect("Should serialize");
        let loaded = DatasetDocument::from_json_str(&json)
            .expect("Should parse")
            .into_dataset()
            .expect("Should materialize");

        assert_datasets_equal(&dataset, &loaded);
    }

    #[test]
    fn test_json_and_zip_variants_agree() {
        let dataset = sample_dataset();
        let dir = tempfile::tempdir().expect("Should create a temp dir");
        let json_path = dir.path().join("dataset.json");
        let zip_path = dir.path().join("dataset.zip");

        save_json(&dataset, &json_path).expect("Should save JSON");
        save_zip(&dataset, &zip_path).expect("Should save zip");

        let from_json = load_json(&json_path).expect("Should load JSON");
        let from_zip = load_zip(&zip_path).expect("Should load zip");

        assert_datasets_equal(&from_json, &from_zip);
        assert_datasets_equal(&dataset, &from_json);
    }

    #[test]
    fn test_load_leaves_name_index_stale() {
        let dataset = sample_dataset();
        let json = DatasetDocument::from_dataset(&dataset)
            .unwrap()
            .to_json_string()
            .unwrap();
        let loaded = DatasetDocument::from_json_str(&json)
            .unwrap()
            .into_dataset()
            .unwrap();

        assert_eq!(loaded.id_for_name("Thalamus"), None);
        loaded.rebuild_name_index();
        assert_eq!(loaded.id_for_name("Thalamus"), Some(7));
    }

    #[test]
    fn test_missing_measurement_block_loads_as_unset() {
        let dataset = sample_dataset();
        let mut document = DatasetDocument::from_dataset(&dataset).unwrap();
        document
            .structures
            .get_mut(&7)
            .unwrap()
            .rois
            .get_mut(&4)
            .unwrap()
            .measurements = None;

        let json = document.to_json_string().unwrap();
        let loaded = DatasetDocument::from_json_str(&json)
            .unwrap()
            .into_dataset()
            .unwrap();

        let region = loaded.get(7).unwrap().region(4).expect("Region should load");
        assert_eq!(region.measurement, None);
        assert_eq!(region.polygon, sample_polygon());
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        assert!(DatasetDocument::from_json_str("{ not json").is_err());

        let dir = tempfile::tempdir().expect("Should create a temp dir");
        let path = dir.path().join("missing.json");
        assert!(load_json(&path).is_err());
    }
}
