//! # Atlas Quantification Library
//!
//! A library for turning a labeled volumetric image (one integer structure id
//! per voxel) into a hierarchical, queryable dataset: one polygon region per
//! (structure, slice), per-region and per-structure intensity statistics, and
//! a navigable anatomical hierarchy reconstructed from a structure
//! description table.
//!
//! ## Core Features
//!
//! - **Trait-based Collaborators**: rasterization and region statistics sit
//!   behind traits, so host-specific image processing can be swapped in
//! - **Parallel Decoding**: slices are claimed work-stealing style by a pool
//!   of workers, with cooperative cancellation
//! - **Pooled Statistics**: per-structure aggregates use the statistically
//!   valid pooled-variance combination, not a naive re-average
//! - **Ontology Reconstruction**: a deterministic hierarchy built from each
//!   structure's ancestry path, with descendant and text queries
//! - **Portable Documents**: JSON and zipped containers with a binary-safe,
//!   base64-wrapped geometry encoding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use atlas::{
//!     AtlasDataset, CoverageQuantifier, LabelDecoder, LabelVolume, MeasurementEngine,
//!     OntologyTree, PixelEdgeRasterizer, StructureRow, StructureTable,
//! };
//!
//! // Describe the structures expected in the labeled volume
//! let rows: Vec<StructureRow> = vec![
//!     [
//!         ("id".to_string(), "7".to_string()),
//!         ("name".to_string(), "thalamus".to_string()),
//!     ]
//!     .into_iter()
//!     .collect(),
//! ];
//! let dataset = AtlasDataset::new();
//! dataset.load_table(StructureTable::parse_rows(rows));
//!
//! // Decode the labeled volume into per-structure, per-slice regions
//! let labels = LabelVolume::from_labels(2, 2, 1, vec![0, 7, 7, 0])?;
//! LabelDecoder::new().decode(&labels, &dataset, &PixelEdgeRasterizer)?;
//! dataset.rebuild_name_index();
//!
//! // Measure intensities and pool them into per-structure aggregates
//! MeasurementEngine::new().measure(&dataset, &labels, &CoverageQuantifier)?;
//!
//! // Navigate and persist
//! let _hierarchy = OntologyTree::build(&dataset);
//! atlas::codec::save_zip(&dataset, "dataset.zip")?;
//! # Ok::<(), atlas::AtlasError>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Core modules
pub mod algorithms;
pub mod codec;
pub mod dataset;
pub mod decode;
pub mod error;
pub mod measure;
pub mod ontology;
pub mod structure;
pub mod traits;
pub mod types;
pub mod volume;

// Re-exports for convenience
pub use algorithms::{CoverageQuantifier, ImageprocContourRasterizer, PixelEdgeRasterizer};
pub use codec::{load_json, load_zip, save_json, save_zip, DatasetDocument};
pub use dataset::{AtlasDataset, DatasetMetadata, RegionHandle, RegionInstance, StructureEntry};
pub use decode::{DecodeOptions, DecodeReport, LabelDecoder, SkippedUnit};
pub use error::{AtlasError, Result};
pub use measure::{
    AnalysisLevel, AnalysisMeasurement, MeasureOptions, MeasureReport, MeasurementEngine,
    Normalization, RenderRequest,
};
pub use ontology::{NodeKind, NodePath, OntologyNode, OntologyTree};
pub use structure::{StructureRecord, StructureRow, StructureTable};
pub use traits::*;
pub use types::{RegionMeasurement, RegionPolygon, RegionShape, RegionStats};
pub use volume::{Calibration, LabelVolume, ScalarVolume, VolumeDescriptor};

/// Cooperative cancellation token, checked at the top of every claimed unit
/// of parallel work. A cancelled pass yields a partially populated (but never
/// corrupt) dataset.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
