use serde::{Deserialize, Serialize};

use crate::{
    error::{AtlasError, Result},
    traits::{IntensitySource, LabelSource},
};

/// Spatial calibration of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub pixel_depth: f64,
    pub unit: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pixel_width: 1.0,
            pixel_height: 1.0,
            pixel_depth: 1.0,
            unit: "pixel".to_string(),
        }
    }
}

/// Descriptive snapshot of a volume, used for dataset metadata capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub title: String,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub bit_depth: u32,
    pub calibration: Calibration,
}

/// An owned, in-memory labeled volume
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    width: u32,
    height: u32,
    slices: u32,
    title: String,
    path: String,
    calibration: Calibration,
    data: Vec<i32>,
}

impl LabelVolume {
    /// Create a background-only volume
    pub fn new(width: u32, height: u32, slices: u32) -> Self {
        Self {
            width,
            height,
            slices,
            title: String::new(),
            path: String::new(),
            calibration: Calibration::default(),
            data: vec![0; (width * height * slices) as usize],
        }
    }

    /// Create a volume from slice-major labels (slice, then row, then column)
    pub fn from_labels(width: u32, height: u32, slices: u32, data: Vec<i32>) -> Result<Self> {
        let expected = (width * height * slices) as usize;
        if data.len() != expected {
            return Err(AtlasError::DimensionMismatch(format!(
                "expected {} labels for {}x{}x{}, got {}",
                expected,
                width,
                height,
                slices,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            slices,
            title: String::new(),
            path: String::new(),
            calibration: Calibration::default(),
            data,
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    fn index(&self, x: u32, y: u32, slice: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        debug_assert!((1..=self.slices).contains(&slice));
        (((slice - 1) * self.height + y) * self.width + x) as usize
    }

    pub fn set_label(&mut self, x: u32, y: u32, slice: u32, label: i32) {
        let index = self.index(x, y, slice);
        self.data[index] = label;
    }
}

impl LabelSource for LabelVolume {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn slices(&self) -> u32 {
        self.slices
    }

    fn label(&self, x: u32, y: u32, slice: u32) -> i32 {
        self.data[self.index(x, y, slice)]
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn calibration(&self) -> Calibration {
        self.calibration.clone()
    }
}

// A labeled volume can also serve as the quantification target, e.g. when
// measuring label coverage itself.
impl IntensitySource for LabelVolume {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn slices(&self) -> u32 {
        self.slices
    }

    fn value(&self, x: u32, y: u32, slice: u32) -> f64 {
        self.data[self.index(x, y, slice)] as f64
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn calibration(&self) -> Calibration {
        self.calibration.clone()
    }
}

/// An owned 32-bit scalar volume, the render target for synthetic outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarVolume {
    width: u32,
    height: u32,
    slices: u32,
    title: String,
    calibration: Calibration,
    data: Vec<f32>,
}

impl ScalarVolume {
    /// Create a zero-filled scalar volume
    pub fn new(title: impl Into<String>, width: u32, height: u32, slices: u32) -> Self {
        Self {
            width,
            height,
            slices,
            title: title.into(),
            calibration: Calibration::default(),
            data: vec![0.0; (width * height * slices) as usize],
        }
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    fn index(&self, x: u32, y: u32, slice: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        debug_assert!((1..=self.slices).contains(&slice));
        (((slice - 1) * self.height + y) * self.width + x) as usize
    }

    pub fn set_value(&mut self, x: u32, y: u32, slice: u32, value: f32) {
        let index = self.index(x, y, slice);
        self.data[index] = value;
    }

    pub fn value_at(&self, x: u32, y: u32, slice: u32) -> f32 {
        self.data[self.index(x, y, slice)]
    }

    /// Min/max over the whole stack, for display scaling
    pub fn display_range(&self) -> (f32, f32) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in &self.data {
            min = min.min(v);
            max = max.max(v);
        }
        if min > max {
            (0.0, 0.0)
        } else {
            (min, max)
        }
    }
}

impl IntensitySource for ScalarVolume {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn slices(&self) -> u32 {
        self.slices
    }

    fn value(&self, x: u32, y: u32, slice: u32) -> f64 {
        self.data[self.index(x, y, slice)] as f64
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn calibration(&self) -> Calibration {
        self.calibration.clone()
    }
}
