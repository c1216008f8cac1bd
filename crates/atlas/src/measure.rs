use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};
use tracing::{debug, info, warn};

use crate::{
    dataset::AtlasDataset,
    decode::{build_pool, SkippedUnit},
    error::Result,
    traits::{IntensitySource, RegionQuantifier},
    types::RegionMeasurement,
    volume::ScalarVolume,
    CancelToken,
};

/// Whether a rendered value comes from the structure aggregate or from the
/// individual region on each slice
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisLevel {
    PerStructure,
    PerRegion,
}

/// Which measurement is rendered into the output volume
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisMeasurement {
    SumIntensity,
    MeanIntensity,
    StdIntensity,
    MinIntensity,
    MaxIntensity,
    Id,
}

/// How rendered values are scaled
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Normalization {
    NoNormalization,
    /// 100% = the measurement summed over all structures
    PercentOfAll,
    /// 100% = the measurement summed over the selected structures
    PercentOfSelected,
}

/// A full output-volume rendering request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RenderRequest {
    pub level: AnalysisLevel,
    pub measurement: AnalysisMeasurement,
    pub normalization: Normalization,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            level: AnalysisLevel::PerStructure,
            measurement: AnalysisMeasurement::MeanIntensity,
            normalization: Normalization::NoNormalization,
        }
    }
}

/// Options for a measurement pass
#[derive(Debug, Clone, Default)]
pub struct MeasureOptions {
    /// Worker count; `None` uses the available hardware parallelism
    pub threads: Option<usize>,
    /// Checked at the top of every claimed structure
    pub cancel: CancelToken,
}

/// Outcome of a measurement pass
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureReport {
    pub regions: usize,
    pub skipped: Vec<SkippedUnit>,
    pub complete: bool,
}

/// Computes per-region statistics through a quantifier collaborator, pools
/// them into per-structure aggregates and renders synthetic output volumes.
#[derive(Debug, Clone, Default)]
pub struct MeasurementEngine {
    options: MeasureOptions,
}

impl MeasurementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MeasureOptions) -> Self {
        Self { options }
    }

    /// (Re-)measure every region of every structure against `volume`.
    ///
    /// Work is partitioned per structure, so no two workers ever touch the
    /// same region map. Each region's measurement is replaced wholesale; a
    /// quantifier failure skips that one region and the pass continues.
    /// Finishes by rebuilding all per-structure aggregates.
    pub fn measure(
        &self,
        dataset: &AtlasDataset,
        volume: &dyn IntensitySource,
        quantifier: &dyn RegionQuantifier,
    ) -> Result<MeasureReport> {
        let start = Instant::now();
        let pool = build_pool(self.options.threads)?;
        let cancel = &self.options.cancel;
        let measured = AtomicUsize::new(0);
        let skipped: Mutex<Vec<SkippedUnit>> = Mutex::new(Vec::new());

        let entries = dataset.entries();
        pool.install(|| {
            entries.par_iter().for_each(|entry| {
                if cancel.is_cancelled() {
                    return;
                }
                for region in entry.regions() {
                    match quantifier.statistics(volume, region.slice, &region.polygon) {
                        Ok(stats) => {
                            entry.set_region_measurement(
                                region.slice,
                                RegionMeasurement::from_stats(&stats),
                            );
                            measured.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            warn!(
                                id = entry.id(),
                                slice = region.slice,
                                error = %err,
                                "skipping region, quantification failed"
                            );
                            skipped.lock().push(SkippedUnit {
                                slice: region.slice,
                                label: entry.id(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            });
        });

        dataset.capture_quantifications(&volume.descriptor());
        dataset.capture_dimensions(&volume.descriptor());
        dataset.rebuild_structure_aggregates();

        let report = MeasureReport {
            regions: measured.into_inner(),
            skipped: skipped.into_inner(),
            complete: !cancel.is_cancelled(),
        };
        info!(
            regions = report.regions,
            skipped = report.skipped.len(),
            complete = report.complete,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "measurement pass finished"
        );
        Ok(report)
    }

    /// Render a synthetic 32-bit output volume: every voxel of every region of
    /// the requested structures is filled with the selected measurement.
    ///
    /// `ids` restricts rendering; `None` renders all structures. Workers own
    /// disjoint structures, which keeps voxel writes disjoint because no two
    /// structures overlap in a one-label-per-voxel source volume. The
    /// normalization denominator is computed once, before the parallel fill.
    pub fn render_output(
        &self,
        dataset: &AtlasDataset,
        request: &RenderRequest,
        ids: Option<&BTreeSet<i32>>,
    ) -> Result<ScalarVolume> {
        let start = Instant::now();
        let title = format!(
            "{}_{}_{}",
            request.level, request.measurement, request.normalization
        );
        let mut output = dataset.calibrated_scalar_volume(title)?;

        let entries = dataset.entries();
        let selected: Vec<_> = match ids {
            Some(ids) => entries
                .iter()
                .filter(|entry| ids.contains(&entry.id()))
                .cloned()
                .collect(),
            None => entries.clone(),
        };

        let denominator = match request.normalization {
            Normalization::NoNormalization => None,
            Normalization::PercentOfAll => Some(
                entries
                    .iter()
                    .map(|e| measurement_value(&e.aggregate(), request.measurement, e.id()))
                    .sum::<f64>(),
            ),
            Normalization::PercentOfSelected => Some(
                selected
                    .iter()
                    .map(|e| measurement_value(&e.aggregate(), request.measurement, e.id()))
                    .sum::<f64>(),
            ),
        };

        let scale = move |value: f64| -> f32 {
            match denominator {
                None => value as f32,
                Some(d) if d == 0.0 => 0.0,
                Some(d) => (value / d * 100.0) as f32,
            }
        };

        let pool = build_pool(self.options.threads)?;
        let fills: Vec<Vec<(u32, u32, u32, f32)>> = pool.install(|| {
            selected
                .par_iter()
                .map(|entry| {
                    let structure_value =
                        measurement_value(&entry.aggregate(), request.measurement, entry.id());
                    let mut fill = Vec::new();
                    for region in entry.regions() {
                        let value = match request.level {
                            AnalysisLevel::PerStructure => structure_value,
                            AnalysisLevel::PerRegion => match &region.measurement {
                                Some(m) => measurement_value(m, request.measurement, entry.id()),
                                None => {
                                    debug!(
                                        id = entry.id(),
                                        slice = region.slice,
                                        "region without measurement skipped during rendering"
                                    );
                                    continue;
                                }
                            },
                        };
                        let filled = scale(value);
                        for (x, y) in region.polygon.covered_voxels() {
                            fill.push((x, y, region.slice, filled));
                        }
                    }
                    fill
                })
                .collect()
        });

        let (width, height, slices) = {
            let metadata = dataset.metadata();
            (metadata.width, metadata.height, metadata.slices)
        };
        for (x, y, slice, value) in fills.into_iter().flatten() {
            if x < width && y < height && slice >= 1 && slice <= slices {
                output.set_value(x, y, slice, value);
            }
        }

        info!(
            structures = selected.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "output volume rendered"
        );
        Ok(output)
    }
}

/// Select one scalar out of a measurement. For structure aggregates the sum
/// is the pooled total; for regions it is the region total.
fn measurement_value(
    measurement: &RegionMeasurement,
    kind: AnalysisMeasurement,
    id: i32,
) -> f64 {
    match kind {
        AnalysisMeasurement::SumIntensity => measurement.total_intensity,
        AnalysisMeasurement::MeanIntensity => measurement.mean_intensity,
        AnalysisMeasurement::StdIntensity => measurement.std_intensity,
        AnalysisMeasurement::MinIntensity => measurement.min_intensity,
        AnalysisMeasurement::MaxIntensity => measurement.max_intensity,
        AnalysisMeasurement::Id => id as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{CoverageQuantifier, PixelEdgeRasterizer};
    use crate::dataset::RegionInstance;
    use crate::decode::LabelDecoder;
    use crate::structure::{StructureRow, StructureTable};
    use crate::types::RegionPolygon;
    use crate::volume::LabelVolume;

    fn row(pairs: &[(&str, &str)]) -> StructureRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Decoded 2x2x2 dataset; intensities equal labels
    fn decoded() -> (AtlasDataset, LabelVolume) {
        let volume = LabelVolume::from_labels(2, 2, 2, vec![0, 7, 7, 9, 9, 0, 7, 9])
            .expect("Should build the test volume");
        let dataset = AtlasDataset::new();
        dataset.load_table(StructureTable::parse_rows(vec![
            row(&[("id", "7"), ("name", "thalamus")]),
            row(&[("id", "9"), ("name", "cortex")]),
        ]));
        LabelDecoder::new()
            .decode(&volume, &dataset, &PixelEdgeRasterizer)
            .expect("Decode should succeed");
        (dataset, volume)
    }

    #[test]
    fn test_measure_fills_region_and_structure_stats() {
        let (dataset, volume) = decoded();

        let report = MeasurementEngine::new()
            .measure(&dataset, &volume, &CoverageQuantifier)
            .expect("Measure should succeed");

        assert!(report.complete);
        assert!(report.skipped.is_empty());
        assert_eq!(report.regions, 4);

        let thalamus = dataset.get(7).expect("Thalamus should exist");
        let slice1 = thalamus.region(1).unwrap().measurement.unwrap();
        assert_eq!(slice1.area, 2.0);
        assert_eq!(slice1.mean_intensity, 7.0);
        assert_eq!(slice1.total_intensity, 14.0);
        assert_eq!(slice1.std_intensity, 0.0);

        // 3 voxels of constant intensity 7 across two slices
        let aggregate = thalamus.aggregate();
        assert_eq!(aggregate.volume, 3.0);
        assert_eq!(aggregate.mean_intensity, 7.0);
        assert_eq!(aggregate.min_intensity, 7.0);
        assert_eq!(aggregate.max_intensity, 7.0);
    }

    #[test]
    fn test_render_per_structure_mean() {
        let (dataset, volume) = decoded();
        MeasurementEngine::new()
            .measure(&dataset, &volume, &CoverageQuantifier)
            .expect("Measure should succeed");

        let output = MeasurementEngine::new()
            .render_output(&dataset, &RenderRequest::default(), None)
            .expect("Render should succeed");

        // Labeled voxels carry their structure's mean, background stays 0
        assert_eq!(output.value_at(1, 0, 1), 7.0);
        assert_eq!(output.value_at(0, 1, 1), 7.0);
        assert_eq!(output.value_at(1, 1, 1), 9.0);
        assert_eq!(output.value_at(0, 0, 1), 0.0);
        assert_eq!(output.value_at(0, 0, 2), 9.0);
    }

    #[test]
    fn test_render_id_measurement() {
        let (dataset, volume) = decoded();
        MeasurementEngine::new()
            .measure(&dataset, &volume, &CoverageQuantifier)
            .expect("Measure should succeed");

        let request = RenderRequest {
            measurement: AnalysisMeasurement::Id,
            ..Default::default()
        };
        let output = MeasurementEngine::new()
            .render_output(&dataset, &request, None)
            .expect("Render should succeed");

        assert_eq!(output.value_at(1, 0, 1), 7.0);
        assert_eq!(output.value_at(1, 1, 2), 9.0);
    }

    #[test]
    fn test_render_percent_of_all() {
        let (dataset, volume) = decoded();
        MeasurementEngine::new()
            .measure(&dataset, &volume, &CoverageQuantifier)
            .expect("Measure should succeed");

        let request = RenderRequest {
            measurement: AnalysisMeasurement::SumIntensity,
            normalization: Normalization::PercentOfAll,
            ..Default::default()
        };
        let output = MeasurementEngine::new()
            .render_output(&dataset, &request, None)
            .expect("Render should succeed");

        // Totals: thalamus 3 voxels of 7 = 21, cortex 3 voxels of 9 = 27
        let expected = (21.0f64 / 48.0 * 100.0) as f32;
        assert!((output.value_at(1, 0, 1) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_render_selection_restricts_fill() {
        let (dataset, volume) = decoded();
        MeasurementEngine::new()
            .measure(&dataset, &volume, &CoverageQuantifier)
            .expect("Measure should succeed");

        let only_7: BTreeSet<i32> = [7].into_iter().collect();
        let output = MeasurementEngine::new()
            .render_output(&dataset, &RenderRequest::default(), Some(&only_7))
            .expect("Render should succeed");

        assert_eq!(output.value_at(1, 0, 1), 7.0);
        assert_eq!(output.value_at(1, 1, 1), 0.0, "Unselected structure stays empty");
    }

    #[test]
    fn test_render_skips_unmeasured_regions_at_region_level() {
        let dataset = AtlasDataset::new();
        let entry = dataset.get_or_create(5);
        entry.put_region(RegionInstance {
            slice: 1,
            polygon: RegionPolygon::rect(0, 0, 2, 2),
            measurement: None,
        });
        let volume = LabelVolume::new(4, 4, 1);
        dataset.capture_dimensions(&<LabelVolume as crate::traits::LabelSource>::descriptor(
            &volume,
        ));

        let request = RenderRequest {
            level: AnalysisLevel::PerRegion,
            ..Default::default()
        };
        let output = MeasurementEngine::new()
            .render_output(&dataset, &request, None)
            .expect("Render should succeed");

        assert_eq!(output.value_at(0, 0, 1), 0.0);
    }

    #[test]
    fn test_pooled_structure_values_from_spec_regions() {
        let dataset = AtlasDataset::new();
        let entry = dataset.get_or_create(1);
        for slice in [1u32, 2u32] {
            entry.put_region(RegionInstance {
                slice,
                polygon: RegionPolygon::rect(0, 0, 1, 1),
                measurement: Some(RegionMeasurement {
                    area: 10.0,
                    volume: 0.0,
                    total_intensity: 50.0,
                    mean_intensity: 5.0,
                    std_intensity: 2.0,
                    min_intensity: 1.0,
                    max_intensity: 8.0,
                }),
            });
        }
        dataset.rebuild_structure_aggregates();

        let aggregate = entry.aggregate();
        assert_eq!(aggregate.volume, 20.0);
        assert_eq!(aggregate.mean_intensity, 5.0);
        assert!((aggregate.std_intensity - 2.0).abs() < 1e-9);
    }
}
