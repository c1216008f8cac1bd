use std::collections::BTreeSet;

use bincode::{Decode, Encode};
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RegionShape {
    /// The exterior boundary of the shape (outer contour)
    pub exterior: Vec<[f32; 2]>,
    /// Interior boundaries (holes within the shape), wound opposite to the
    /// exterior so signed-area computations subtract them
    pub holes: Vec<Vec<[f32; 2]>>,
}

impl RegionShape {
    pub fn new(exterior: Vec<[f32; 2]>, holes: Vec<Vec<[f32; 2]>>) -> Self {
        Self { exterior, holes }
    }

    /// Convert to geo-types Polygon for geometric operations
    pub fn to_geo_polygon(&self) -> Polygon<f32> {
        let exterior_coords: Vec<Coord<f32>> = self
            .exterior
            .iter()
            .map(|&[x, y]| Coord { x, y })
            .collect();

        let exterior_linestring = LineString::new(exterior_coords);

        let holes: Vec<LineString<f32>> = self
            .holes
            .iter()
            .map(|hole| {
                let hole_coords: Vec<Coord<f32>> =
                    hole.iter().map(|&[x, y]| Coord { x, y }).collect();
                LineString::new(hole_coords)
            })
            .collect();

        Polygon::new(exterior_linestring, holes)
    }

    /// Calculate the area of the shape (exterior minus holes)
    pub fn area(&self) -> f64 {
        use geo::Area;
        self.to_geo_polygon().unsigned_area() as f64
    }

    /// Check if this shape contains holes
    pub fn has_holes(&self) -> bool {
        !self.holes.is_empty()
    }

    /// Get the bounding box of the shape
    pub fn bounding_box(&self) -> ([f32; 2], [f32; 2]) {
        let mut min_x = f32::INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut max_y = f32::NEG_INFINITY;

        for &[x, y] in &self.exterior {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        ([min_x, min_y], [max_x, max_y])
    }

    /// Check whether a point lies inside the shape (holes excluded)
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        use geo::Contains;
        self.to_geo_polygon().contains(&Point::new(x, y))
    }
}

/// The full outline of one structure on one slice. A label can occupy several
/// disconnected blobs on a slice, so the outline is a collection of shapes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RegionPolygon {
    pub shapes: Vec<RegionShape>,
}

impl RegionPolygon {
    pub fn new(shapes: Vec<RegionShape>) -> Self {
        Self { shapes }
    }

    pub fn single(shape: RegionShape) -> Self {
        Self {
            shapes: vec![shape],
        }
    }

    /// Axis-aligned rectangle covering pixels `[x, x + width) x [y, y + height)`
    pub fn rect(x: u32, y: u32, width: u32, height: u32) -> Self {
        let (x0, y0) = (x as f32, y as f32);
        let (x1, y1) = ((x + width) as f32, (y + height) as f32);
        Self::single(RegionShape::new(
            vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]],
            Vec::new(),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.iter().all(|s| s.exterior.is_empty())
    }

    /// Total area over all shapes (holes excluded)
    pub fn area(&self) -> f64 {
        self.shapes.iter().map(|s| s.area()).sum()
    }

    /// Merged bounding box over all shapes, or None for an empty outline
    pub fn bounding_box(&self) -> Option<([f32; 2], [f32; 2])> {
        let mut boxes = self
            .shapes
            .iter()
            .filter(|s| !s.exterior.is_empty())
            .map(|s| s.bounding_box());

        let first = boxes.next()?;
        Some(boxes.fold(first, |(min, max), (lo, hi)| {
            (
                [min[0].min(lo[0]), min[1].min(lo[1])],
                [max[0].max(hi[0]), max[1].max(hi[1])],
            )
        }))
    }

    /// Convert to a geo-types MultiPolygon for geometric operations
    pub fn to_multi_polygon(&self) -> MultiPolygon<f32> {
        MultiPolygon::new(self.shapes.iter().map(|s| s.to_geo_polygon()).collect())
    }

    /// Build from a geo-types MultiPolygon, dropping closing duplicate points
    pub fn from_multi_polygon(multi: &MultiPolygon<f32>) -> Self {
        fn ring_points(ring: &LineString<f32>) -> Vec<[f32; 2]> {
            let mut points: Vec<[f32; 2]> = ring.coords().map(|c| [c.x, c.y]).collect();
            if points.len() > 1 && points.first() == points.last() {
                points.pop();
            }
            points
        }

        let shapes = multi
            .iter()
            .map(|polygon| RegionShape {
                exterior: ring_points(polygon.exterior()),
                holes: polygon.interiors().iter().map(ring_points).collect(),
            })
            .collect();

        Self { shapes }
    }

    /// True if the centre of voxel (x, y) lies inside the outline
    pub fn contains_voxel(&self, x: u32, y: u32) -> bool {
        let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
        self.shapes.iter().any(|s| s.contains_point(cx, cy))
    }

    /// All voxels whose centre lies inside the outline, in row-major order
    pub fn covered_voxels(&self) -> Vec<(u32, u32)> {
        let mut covered = BTreeSet::new();

        for shape in &self.shapes {
            if shape.exterior.is_empty() {
                continue;
            }
            let ([min_x, min_y], [max_x, max_y]) = shape.bounding_box();
            let x0 = min_x.floor().max(0.0) as u32;
            let y0 = min_y.floor().max(0.0) as u32;
            let x1 = max_x.ceil().max(0.0) as u32;
            let y1 = max_y.ceil().max(0.0) as u32;

            for y in y0..y1 {
                for x in x0..x1 {
                    if shape.contains_point(x as f32 + 0.5, y as f32 + 0.5) {
                        covered.insert((y, x));
                    }
                }
            }
        }

        covered.into_iter().map(|(y, x)| (x, y)).collect()
    }
}

/// Raw per-region statistics returned by a region quantifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionStats {
    pub area: f64,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Intensity and area statistics for one region or one whole structure
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionMeasurement {
    pub area: f64,
    pub volume: f64,
    pub total_intensity: f64,
    pub mean_intensity: f64,
    pub std_intensity: f64,
    pub min_intensity: f64,
    pub max_intensity: f64,
}

impl RegionMeasurement {
    /// Area-only measurement, recorded when a region is first decoded
    pub fn from_area(area: f64) -> Self {
        Self {
            area,
            ..Self::default()
        }
    }

    /// Per-region measurement from quantifier statistics
    pub fn from_stats(stats: &RegionStats) -> Self {
        Self {
            area: stats.area,
            volume: 0.0,
            total_intensity: stats.mean * stats.area,
            mean_intensity: stats.mean,
            std_intensity: stats.std,
            min_intensity: stats.min,
            max_intensity: stats.max,
        }
    }

    /// Per-structure measurement pooled over region measurements.
    ///
    /// The pooled standard deviation assumes each region's own std was
    /// computed over `area` samples: `sqrt(sum((a_i - 1) * s_i^2) / (volume - k))`.
    /// The denominator collapses to zero or below for regions of area <= 1,
    /// in which case (and for an empty input) the result is 0.
    pub fn pooled<'a, I>(regions: I) -> Self
    where
        I: IntoIterator<Item = &'a RegionMeasurement>,
    {
        let mut pooled = Self::default();
        let mut count = 0usize;
        let mut weighted_variance = 0.0f64;

        for m in regions {
            pooled.volume += m.area;
            pooled.total_intensity += m.total_intensity;
            pooled.min_intensity = if count == 0 {
                m.min_intensity
            } else {
                pooled.min_intensity.min(m.min_intensity)
            };
            pooled.max_intensity = if count == 0 {
                m.max_intensity
            } else {
                pooled.max_intensity.max(m.max_intensity)
            };
            weighted_variance += (m.area - 1.0) * m.std_intensity * m.std_intensity;
            count += 1;
        }

        pooled.mean_intensity = if pooled.volume == 0.0 {
            0.0
        } else {
            pooled.total_intensity / pooled.volume
        };

        let dof = pooled.volume - count as f64;
        pooled.std_intensity = if count == 0 || dof <= 0.0 {
            0.0
        } else {
            let std = (weighted_variance / dof).sqrt();
            if std.is_finite() { std } else { 0.0 }
        };

        pooled
    }
}
