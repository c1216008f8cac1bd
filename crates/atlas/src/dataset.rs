use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    structure::StructureRecord,
    traits::LabelSource,
    types::{RegionMeasurement, RegionPolygon},
    volume::{Calibration, ScalarVolume, VolumeDescriptor},
};

/// Descriptive metadata of the dataset: where the volumes came from, their
/// dimensions and calibration, and which description table was used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Schema/version field embedded in every persisted document
    pub version: String,
    pub date: String,
    pub annotations_title: String,
    pub annotations_path: String,
    pub quantifications_title: String,
    pub quantifications_path: String,
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub bit_depth: u32,
    pub calibration: Calibration,
    pub structure_table_source: String,
    pub structure_table_path: String,
}

impl Default for DatasetMetadata {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            date: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            annotations_title: String::new(),
            annotations_path: String::new(),
            quantifications_title: String::new(),
            quantifications_path: String::new(),
            width: 0,
            height: 0,
            slices: 0,
            bit_depth: 0,
            calibration: Calibration::default(),
            structure_table_source: String::new(),
            structure_table_path: String::new(),
        }
    }
}

/// One structure's outline on one slice, with its measurement.
///
/// Created exactly once per (structure, slice) that contains the structure's
/// label. The measurement starts area-only and is replaced wholesale when the
/// region is (re-)measured; it is `None` only for regions loaded from a
/// document that lacked the measurement block.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionInstance {
    pub slice: u32,
    pub polygon: RegionPolygon,
    pub measurement: Option<RegionMeasurement>,
}

impl RegionInstance {
    /// New region with an area-only measurement derived from the polygon
    pub fn new(slice: u32, polygon: RegionPolygon) -> Self {
        let measurement = Some(RegionMeasurement::from_area(polygon.area()));
        Self {
            slice,
            polygon,
            measurement,
        }
    }
}

/// A structure plus everything extracted for it: its per-slice regions and the
/// aggregate measurement pooled over them.
#[derive(Debug)]
pub struct StructureEntry {
    record: StructureRecord,
    regions: Mutex<BTreeMap<u32, RegionInstance>>,
    aggregate: Mutex<RegionMeasurement>,
}

impl StructureEntry {
    pub fn new(record: StructureRecord) -> Self {
        Self {
            record,
            regions: Mutex::new(BTreeMap::new()),
            aggregate: Mutex::new(RegionMeasurement::default()),
        }
    }

    /// The immutable description record
    pub fn record(&self) -> &StructureRecord {
        &self.record
    }

    pub fn id(&self) -> i32 {
        self.record.id
    }

    /// Insert a region, keyed by its slice. Concurrent inserts for different
    /// slices are both kept; a second insert for the same slice replaces the
    /// first.
    pub fn put_region(&self, region: RegionInstance) {
        self.regions.lock().insert(region.slice, region);
    }

    pub fn region(&self, slice: u32) -> Option<RegionInstance> {
        self.regions.lock().get(&slice).cloned()
    }

    /// Snapshot of all regions, ordered by slice
    pub fn regions(&self) -> Vec<RegionInstance> {
        self.regions.lock().values().cloned().collect()
    }

    pub fn region_slices(&self) -> Vec<u32> {
        self.regions.lock().keys().copied().collect()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn has_regions(&self) -> bool {
        !self.regions.lock().is_empty()
    }

    /// Replace one region's measurement wholesale. Returns false if the slice
    /// holds no region.
    pub fn set_region_measurement(&self, slice: u32, measurement: RegionMeasurement) -> bool {
        match self.regions.lock().get_mut(&slice) {
            Some(region) => {
                region.measurement = Some(measurement);
                true
            }
            None => false,
        }
    }

    /// The pooled per-structure measurement (as of the last aggregate rebuild)
    pub fn aggregate(&self) -> RegionMeasurement {
        *self.aggregate.lock()
    }

    pub fn set_aggregate(&self, measurement: RegionMeasurement) {
        *self.aggregate.lock() = measurement;
    }

    /// Recompute the aggregate by pooling over regions that carry a
    /// measurement; regions with none are skipped.
    pub fn rebuild_aggregate(&self) {
        let regions = self.regions.lock();
        let pooled =
            RegionMeasurement::pooled(regions.values().filter_map(|r| r.measurement.as_ref()));
        drop(regions);
        *self.aggregate.lock() = pooled;
    }
}

/// A flat handle onto one region, for export to external region managers
#[derive(Debug, Clone, PartialEq)]
pub struct RegionHandle {
    /// `<Structure name>-Slice_<4-digit slice>`
    pub name: String,
    pub slice: u32,
    pub polygon: RegionPolygon,
}

/// The in-memory atlas dataset: all structures keyed by id, a derived
/// name-to-id index, named selection profiles and dataset metadata.
///
/// The name index is a derived cache. It is only brought in sync by
/// [`rebuild_name_index`](AtlasDataset::rebuild_name_index); bulk mutation
/// (table loading, decoding, document loading) leaves it stale until the
/// caller rebuilds it.
#[derive(Debug, Default)]
pub struct AtlasDataset {
    atlas: RwLock<BTreeMap<i32, Arc<StructureEntry>>>,
    name_index: RwLock<BTreeMap<String, i32>>,
    profiles: Mutex<BTreeMap<String, BTreeSet<i32>>>,
    metadata: Mutex<DatasetMetadata>,
}

impl AtlasDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a structure record. Does not touch the name index.
    pub fn insert(&self, record: StructureRecord) -> Arc<StructureEntry> {
        let entry = Arc::new(StructureEntry::new(record));
        self.atlas.write().insert(entry.id(), entry.clone());
        entry
    }

    /// Load every record of a parsed description table.
    /// Call [`rebuild_name_index`](AtlasDataset::rebuild_name_index) afterwards
    /// before any name-based lookup.
    pub fn load_table(&self, table: crate::structure::StructureTable) {
        for record in table.into_records() {
            self.insert(record);
        }
    }

    pub fn get(&self, id: i32) -> Option<Arc<StructureEntry>> {
        self.atlas.read().get(&id).cloned()
    }

    /// The entry for `id`, or a freshly synthesized Unknown entry which is
    /// NOT inserted. For read-only contexts.
    pub fn get_or_default(&self, id: i32) -> Arc<StructureEntry> {
        self.get(id)
            .unwrap_or_else(|| Arc::new(StructureEntry::new(StructureRecord::unknown(id))))
    }

    /// The entry for `id`, synthesizing and inserting an Unknown entry if
    /// absent. Concurrent callers racing on the same missing id all observe
    /// the same single inserted entry: the insert happens under the table's
    /// write lock.
    pub fn get_or_create(&self, id: i32) -> Arc<StructureEntry> {
        if let Some(entry) = self.atlas.read().get(&id) {
            return entry.clone();
        }
        let mut atlas = self.atlas.write();
        atlas
            .entry(id)
            .or_insert_with(|| Arc::new(StructureEntry::new(StructureRecord::unknown(id))))
            .clone()
    }

    /// Insert a region into the owning structure's per-slice map, creating the
    /// structure if the id has not been seen yet
    pub fn put_region(&self, id: i32, region: RegionInstance) {
        self.get_or_create(id).put_region(region);
    }

    /// Full O(n) rebuild of the name-to-id index from the id map. Must be
    /// called after bulk structure mutation, before name-based lookup.
    pub fn rebuild_name_index(&self) {
        let rebuilt: BTreeMap<String, i32> = self
            .atlas
            .read()
            .values()
            .map(|entry| (entry.record().name.clone(), entry.id()))
            .collect();
        *self.name_index.write() = rebuilt;
    }

    pub fn id_for_name(&self, name: &str) -> Option<i32> {
        self.name_index.read().get(name).copied()
    }

    /// Ids in the name index, ordered by structure name
    pub fn ids_by_name(&self) -> Vec<i32> {
        self.name_index.read().values().copied().collect()
    }

    pub fn structure_ids(&self) -> Vec<i32> {
        self.atlas.read().keys().copied().collect()
    }

    /// Snapshot of all entries, ordered by id
    pub fn entries(&self) -> Vec<Arc<StructureEntry>> {
        self.atlas.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.atlas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.atlas.read().is_empty()
    }

    /// Recompute every structure's aggregate from its regions
    pub fn rebuild_structure_aggregates(&self) {
        for entry in self.entries() {
            entry.rebuild_aggregate();
        }
    }

    /// All regions of all structures, as (structure id, region) pairs
    pub fn all_regions(&self) -> Vec<(i32, RegionInstance)> {
        self.entries()
            .iter()
            .flat_map(|entry| {
                entry
                    .regions()
                    .into_iter()
                    .map(|region| (entry.id(), region))
            })
            .collect()
    }

    pub fn regions_for(&self, id: i32) -> Vec<RegionInstance> {
        self.get(id).map(|entry| entry.regions()).unwrap_or_default()
    }

    /// Flat, name-sorted list of region handles for export to an external
    /// region manager. `ids` restricts the export; `None` or an empty set
    /// exports everything.
    pub fn region_manifest(&self, ids: Option<&BTreeSet<i32>>) -> Vec<RegionHandle> {
        let entries = self.entries();
        let selected: Vec<&Arc<StructureEntry>> = match ids {
            Some(ids) if !ids.is_empty() => entries
                .iter()
                .filter(|entry| ids.contains(&entry.id()))
                .collect(),
            _ => entries.iter().collect(),
        };

        let mut handles: Vec<RegionHandle> = selected
            .iter()
            .flat_map(|entry| {
                let name = entry.record().name.clone();
                entry.regions().into_iter().map(move |region| RegionHandle {
                    name: format!("{}-Slice_{:04}", name, region.slice),
                    slice: region.slice,
                    polygon: region.polygon,
                })
            })
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn save_profile(&self, name: impl Into<String>, ids: BTreeSet<i32>) {
        self.profiles.lock().insert(name.into(), ids);
    }

    pub fn profile(&self, name: &str) -> Option<BTreeSet<i32>> {
        self.profiles.lock().get(name).cloned()
    }

    pub fn remove_profile(&self, name: &str) -> Option<BTreeSet<i32>> {
        self.profiles.lock().remove(name)
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.lock().keys().cloned().collect()
    }

    pub(crate) fn profiles_snapshot(&self) -> BTreeMap<String, BTreeSet<i32>> {
        self.profiles.lock().clone()
    }

    pub(crate) fn restore_profiles(&self, profiles: BTreeMap<String, BTreeSet<i32>>) {
        *self.profiles.lock() = profiles;
    }

    pub fn metadata(&self) -> DatasetMetadata {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: DatasetMetadata) {
        *self.metadata.lock() = metadata;
    }

    /// Record title and path of the labeled volume used for extraction
    pub fn capture_annotations(&self, descriptor: &VolumeDescriptor) {
        let mut metadata = self.metadata.lock();
        metadata.annotations_title = descriptor.title.clone();
        metadata.annotations_path = descriptor.path.clone();
    }

    /// Record title and path of the volume quantifications are measured on
    pub fn capture_quantifications(&self, descriptor: &VolumeDescriptor) {
        let mut metadata = self.metadata.lock();
        metadata.quantifications_title = descriptor.title.clone();
        metadata.quantifications_path = descriptor.path.clone();
    }

    /// Record dimensions and spatial calibration
    pub fn capture_dimensions(&self, descriptor: &VolumeDescriptor) {
        let mut metadata = self.metadata.lock();
        metadata.width = descriptor.width;
        metadata.height = descriptor.height;
        metadata.slices = descriptor.slices;
        metadata.bit_depth = descriptor.bit_depth;
        metadata.calibration = descriptor.calibration.clone();
    }

    /// Record source and path of the structure description table
    pub fn set_structure_table_source(
        &self,
        source: impl Into<String>,
        path: impl Into<String>,
    ) {
        let mut metadata = self.metadata.lock();
        metadata.structure_table_source = source.into();
        metadata.structure_table_path = path.into();
    }

    /// A new zero-filled, calibrated scalar volume matching the recorded
    /// dimensions
    pub fn calibrated_scalar_volume(
        &self,
        title: impl Into<String>,
    ) -> crate::error::Result<ScalarVolume> {
        let metadata = self.metadata.lock();
        if metadata.width == 0 || metadata.height == 0 || metadata.slices == 0 {
            return Err(crate::error::AtlasError::MissingMetadata(
                "volume dimensions have not been captured".to_string(),
            ));
        }
        Ok(
            ScalarVolume::new(title, metadata.width, metadata.height, metadata.slices)
                .with_calibration(metadata.calibration.clone()),
        )
    }

    /// Convenience decode entry point; see [`LabelDecoder`](crate::LabelDecoder)
    pub fn decode_labels(
        &self,
        volume: &dyn LabelSource,
        rasterizer: &dyn crate::traits::RegionRasterizer,
    ) -> crate::error::Result<crate::decode::DecodeReport> {
        crate::decode::LabelDecoder::new().decode(volume, self, rasterizer)
    }
}
