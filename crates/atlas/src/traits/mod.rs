use crate::{
    error::Result,
    types::{RegionPolygon, RegionStats},
    volume::VolumeDescriptor,
};

/// Read-only view over a labeled volume. Labels are integer structure ids,
/// zero is background. Slices are 1-based.
pub trait LabelSource: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn slices(&self) -> u32;

    /// Label at (x, y) on `slice`
    fn label(&self, x: u32, y: u32, slice: u32) -> i32;

    fn title(&self) -> &str {
        ""
    }

    fn path(&self) -> &str {
        ""
    }

    fn bit_depth(&self) -> u32 {
        32
    }

    fn calibration(&self) -> crate::volume::Calibration {
        crate::volume::Calibration::default()
    }

    /// Descriptive snapshot used for dataset metadata capture
    fn descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            title: self.title().to_string(),
            path: self.path().to_string(),
            width: self.width(),
            height: self.height(),
            slices: self.slices(),
            bit_depth: self.bit_depth(),
            calibration: self.calibration(),
        }
    }
}

/// Read-only view over the volume quantifications are measured on.
/// Slices are 1-based.
pub trait IntensitySource: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn slices(&self) -> u32;

    /// Intensity at (x, y) on `slice`
    fn value(&self, x: u32, y: u32, slice: u32) -> f64;

    fn title(&self) -> &str {
        ""
    }

    fn path(&self) -> &str {
        ""
    }

    fn bit_depth(&self) -> u32 {
        32
    }

    fn calibration(&self) -> crate::volume::Calibration {
        crate::volume::Calibration::default()
    }

    /// Descriptive snapshot used for dataset metadata capture
    fn descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor {
            title: self.title().to_string(),
            path: self.path().to_string(),
            width: self.width(),
            height: self.height(),
            slices: self.slices(),
            bit_depth: self.bit_depth(),
            calibration: self.calibration(),
        }
    }
}

/// Trait for algorithms that turn one label on one slice into a polygon outline
pub trait RegionRasterizer: Send + Sync {
    /// Outline enclosing all voxels equal to `label` on `slice`
    fn rasterize(&self, volume: &dyn LabelSource, slice: u32, label: i32)
        -> Result<RegionPolygon>;
}

/// Trait for algorithms that compute intensity statistics within a polygon
pub trait RegionQuantifier: Send + Sync {
    /// Area, mean, std, min and max over the outline on `slice`
    fn statistics(
        &self,
        volume: &dyn IntensitySource,
        slice: u32,
        polygon: &RegionPolygon,
    ) -> Result<RegionStats>;
}
