use crate::{
    error::{AtlasError, Result},
    traits::{IntensitySource, RegionQuantifier},
    types::{RegionPolygon, RegionStats},
};

/// Quantifier that samples every voxel whose centre lies inside the polygon.
/// The standard deviation is the sample estimate (n - 1 denominator), matching
/// the pooled combination used for per-structure aggregates.
#[derive(Debug, Clone, Default)]
pub struct CoverageQuantifier;

impl RegionQuantifier for CoverageQuantifier {
    fn statistics(
        &self,
        volume: &dyn IntensitySource,
        slice: u32,
        polygon: &RegionPolygon,
    ) -> Result<RegionStats> {
        let mut values = Vec::new();
        for (x, y) in polygon.covered_voxels() {
            if x < volume.width() && y < volume.height() {
                values.push(volume.value(x, y, slice));
            }
        }

        if values.is_empty() {
            return Err(AtlasError::RegionStatistics(format!(
                "polygon covers no voxels on slice {slice}"
            )));
        }

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0f64;
        for &v in &values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let n = values.len() as f64;
        let mean = sum / n;

        let std = if values.len() < 2 {
            0.0
        } else {
            let mut variance_sum = 0.0f64;
            for &v in &values {
                let diff = v - mean;
                variance_sum += diff * diff;
            }
            (variance_sum / (n - 1.0)).sqrt()
        };

        Ok(RegionStats {
            area: n,
            mean,
            std,
            min,
            max,
        })
    }
}
