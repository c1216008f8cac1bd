use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    dataset::{AtlasDataset, RegionInstance},
    error::{AtlasError, Result},
    traits::{LabelSource, RegionRasterizer},
    CancelToken,
};

/// Options for a decode pass
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Worker count; `None` uses the available hardware parallelism
    pub threads: Option<usize>,
    /// Checked at the top of every claimed slice
    pub cancel: CancelToken,
}

/// One unit of work that failed and was skipped
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedUnit {
    pub slice: u32,
    pub label: i32,
    pub reason: String,
}

/// Outcome of a decode pass
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeReport {
    pub slices: u32,
    pub regions: usize,
    pub skipped: Vec<SkippedUnit>,
    /// False when the pass was cancelled; the dataset is then partially
    /// populated but never corrupt.
    pub complete: bool,
}

/// Decodes a labeled volume into per-structure, per-slice regions.
///
/// Slices are claimed work-stealing style by a pool of workers; a worker that
/// finishes a sparse slice immediately picks up the next unclaimed one. The
/// final dataset state does not depend on worker scheduling: regions are keyed
/// by (structure, slice) and structure creation is race-safe.
#[derive(Debug, Clone, Default)]
pub struct LabelDecoder {
    options: DecodeOptions,
}

impl LabelDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DecodeOptions) -> Self {
        Self { options }
    }

    /// Decode every slice of `volume` into `dataset`.
    ///
    /// A rasterizer failure for one (slice, label) pair is logged and skipped;
    /// it never aborts the remaining work. Labels absent from the dataset's
    /// description table get a synthesized Unknown structure.
    pub fn decode(
        &self,
        volume: &dyn LabelSource,
        dataset: &AtlasDataset,
        rasterizer: &dyn RegionRasterizer,
    ) -> Result<DecodeReport> {
        let start = Instant::now();
        let slices = volume.slices();

        dataset.capture_annotations(&volume.descriptor());
        dataset.capture_dimensions(&volume.descriptor());

        let pool = build_pool(self.options.threads)?;
        let cancel = &self.options.cancel;
        let regions = AtomicUsize::new(0);
        let skipped: Mutex<Vec<SkippedUnit>> = Mutex::new(Vec::new());

        pool.install(|| {
            (1..=slices).into_par_iter().for_each(|slice| {
                if cancel.is_cancelled() {
                    return;
                }
                for label in distinct_labels(volume, slice) {
                    match rasterizer.rasterize(volume, slice, label) {
                        Ok(polygon) => {
                            dataset.put_region(label, RegionInstance::new(slice, polygon));
                            regions.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            warn!(slice, label, error = %err, "skipping region, rasterization failed");
                            skipped.lock().push(SkippedUnit {
                                slice,
                                label,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            });
        });

        let report = DecodeReport {
            slices,
            regions: regions.into_inner(),
            skipped: skipped.into_inner(),
            complete: !cancel.is_cancelled(),
        };
        info!(
            slices,
            regions = report.regions,
            skipped = report.skipped.len(),
            complete = report.complete,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "label decode finished"
        );
        Ok(report)
    }
}

/// Distinct non-zero labels present on `slice`, ascending
pub fn distinct_labels(volume: &dyn LabelSource, slice: u32) -> Vec<i32> {
    let mut labels = BTreeSet::new();
    for y in 0..volume.height() {
        for x in 0..volume.width() {
            let value = volume.label(x, y, slice);
            if value != 0 {
                labels.insert(value);
            }
        }
    }
    labels.into_iter().collect()
}

pub(crate) fn build_pool(threads: Option<usize>) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .build()
        .map_err(|e| AtlasError::ThreadPool(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::PixelEdgeRasterizer;
    use crate::structure::{StructureRow, StructureTable};
    use crate::types::RegionPolygon;
    use crate::volume::LabelVolume;

    fn row(pairs: &[(&str, &str)]) -> StructureRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// 2x2x2 volume: slice 1 = [0, 7, 7, 9], slice 2 = [9, 0, 7, 9]
    fn two_slice_volume() -> LabelVolume {
        LabelVolume::from_labels(2, 2, 2, vec![0, 7, 7, 9, 9, 0, 7, 9])
            .expect("Should build the test volume")
            .with_title("annotations")
    }

    fn two_structure_dataset() -> AtlasDataset {
        let dataset = AtlasDataset::new();
        dataset.load_table(StructureTable::parse_rows(vec![
            row(&[("id", "7"), ("name", "thalamus")]),
            row(&[("id", "9"), ("name", "cortex")]),
        ]));
        dataset
    }

    #[test]
    fn test_distinct_labels_excludes_background() {
        let volume = two_slice_volume();

        assert_eq!(distinct_labels(&volume, 1), vec![7, 9]);
        assert_eq!(distinct_labels(&volume, 2), vec![7, 9]);
    }

    #[test]
    fn test_end_to_end_two_slice_scenario() {
        let volume = two_slice_volume();
        let dataset = two_structure_dataset();

        let report = LabelDecoder::new()
            .decode(&volume, &dataset, &PixelEdgeRasterizer)
            .expect("Decode should succeed");

        assert!(report.complete);
        assert!(report.skipped.is_empty());
        assert_eq!(dataset.len(), 2, "No ad-hoc structures should appear");

        let thalamus = dataset.get(7).expect("Thalamus should exist");
        let cortex = dataset.get(9).expect("Cortex should exist");
        assert_eq!(thalamus.region_slices(), vec![1, 2]);
        assert_eq!(cortex.region_slices(), vec![1, 2]);

        // Slice 1 holds two voxels of label 7 and one of label 9
        assert_eq!(thalamus.region(1).unwrap().polygon.area(), 2.0);
        assert_eq!(cortex.region(1).unwrap().polygon.area(), 1.0);
        assert_eq!(thalamus.region(2).unwrap().polygon.area(), 1.0);
        assert_eq!(cortex.region(2).unwrap().polygon.area(), 2.0);

        assert_eq!(dataset.metadata().width, 2);
        assert_eq!(dataset.metadata().annotations_title, "annotations");
    }

    #[test]
    fn test_unknown_labels_get_synthesized_structures() {
        let volume = two_slice_volume();
        let dataset = AtlasDataset::new();

        LabelDecoder::new()
            .decode(&volume, &dataset, &PixelEdgeRasterizer)
            .expect("Decode should succeed");

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(7).unwrap().record().name, "Unknown_id_7");
        assert_eq!(dataset.get(9).unwrap().record().name, "Unknown_id_9");
    }

    #[test]
    fn test_decode_thread_count_independence() {
        let mut volume = LabelVolume::new(16, 16, 5);
        for slice in 1..=5u32 {
            for y in 0..16u32 {
                for x in 0..16u32 {
                    // A few banded blobs per slice, varying with depth
                    let label = match (x / 4 + slice, y / 4) {
                        (a, b) if a == b => 11,
                        (a, _) if a % 3 == 0 => 23,
                        _ => 0,
                    };
                    volume.set_label(x, y, slice, label);
                }
            }
        }

        let decode_with = |threads: usize| {
            let dataset = AtlasDataset::new();
            LabelDecoder::with_options(DecodeOptions {
                threads: Some(threads),
                cancel: CancelToken::new(),
            })
            .decode(&volume, &dataset, &PixelEdgeRasterizer)
            .expect("Decode should succeed");
            dataset
        };

        let single = decode_with(1);
        let parallel = decode_with(4);

        assert_eq!(single.structure_ids(), parallel.structure_ids());
        for id in single.structure_ids() {
            let lhs: Vec<(u32, RegionPolygon)> = single
                .regions_for(id)
                .into_iter()
                .map(|r| (r.slice, r.polygon))
                .collect();
            let rhs: Vec<(u32, RegionPolygon)> = parallel
                .regions_for(id)
                .into_iter()
                .map(|r| (r.slice, r.polygon))
                .collect();
            assert_eq!(lhs, rhs, "Region sets should not depend on scheduling");
        }
    }

    #[test]
    fn test_failing_unit_is_skipped_not_fatal() {
        struct FailOn {
            inner: PixelEdgeRasterizer,
            slice: u32,
            label: i32,
        }

        impl RegionRasterizer for FailOn {
            fn rasterize(
                &self,
                volume: &dyn LabelSource,
                slice: u32,
                label: i32,
            ) -> crate::error::Result<RegionPolygon> {
                if slice == self.slice && label == self.label {
                    return Err(AtlasError::ImageProcessing("injected failure".to_string()));
                }
                self.inner.rasterize(volume, slice, label)
            }
        }

        let volume = two_slice_volume();
        let dataset = two_structure_dataset();
        let rasterizer = FailOn {
            inner: PixelEdgeRasterizer,
            slice: 2,
            label: 9,
        };

        let report = LabelDecoder::new()
            .decode(&volume, &dataset, &rasterizer)
            .expect("Decode should still succeed overall");

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].slice, 2);
        assert_eq!(report.skipped[0].label, 9);
        assert_eq!(report.regions, 3);
        // Only the failing (slice, label) pair is missing
        assert!(dataset.get(9).unwrap().region(2).is_none());
        assert!(dataset.get(9).unwrap().region(1).is_some());
        assert_eq!(dataset.get(7).unwrap().region_count(), 2);
    }

    #[test]
    fn test_cancelled_decode_is_partial_and_reported() {
        let volume = two_slice_volume();
        let dataset = two_structure_dataset();

        let cancel = CancelToken::new();
        cancel.cancel();

        let report = LabelDecoder::with_options(DecodeOptions {
            threads: Some(1),
            cancel,
        })
        .decode(&volume, &dataset, &PixelEdgeRasterizer)
        .expect("A cancelled decode is not an error");

        assert!(!report.complete);
        assert_eq!(report.regions, 0);
    }
}
