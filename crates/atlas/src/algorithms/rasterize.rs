use std::collections::BTreeMap;

use geo::Contains;
use geo_types::Point;
use image::{GrayImage, Luma};

use crate::{
    error::{AtlasError, Result},
    traits::{LabelSource, RegionRasterizer},
    types::{RegionPolygon, RegionShape},
};

/// Exact rasterizer: traces the pixel-edge boundary of all voxels carrying the
/// requested label, so a single pixel yields a unit square and areas match
/// voxel counts. Holes are detected from ring orientation.
#[derive(Debug, Clone, Default)]
pub struct PixelEdgeRasterizer;

impl RegionRasterizer for PixelEdgeRasterizer {
    fn rasterize(
        &self,
        volume: &dyn LabelSource,
        slice: u32,
        label: i32,
    ) -> Result<RegionPolygon> {
        let width = volume.width() as i64;
        let height = volume.height() as i64;
        let inside = |x: i64, y: i64| -> bool {
            x >= 0
                && y >= 0
                && x < width
                && y < height
                && volume.label(x as u32, y as u32, slice) == label
        };

        // Directed boundary edges between pixel corners, region kept on the
        // left. Keyed by start corner; a corner where two blobs touch
        // diagonally has two outgoing edges.
        let mut edges: BTreeMap<(i64, i64), Vec<(i64, i64)>> = BTreeMap::new();
        let mut edge_count = 0usize;
        for y in 0..height {
            for x in 0..width {
                if !inside(x, y) {
                    continue;
                }
                if !inside(x, y - 1) {
                    edges.entry((x, y)).or_default().push((x + 1, y));
                    edge_count += 1;
                }
                if !inside(x + 1, y) {
                    edges.entry((x + 1, y)).or_default().push((x + 1, y + 1));
                    edge_count += 1;
                }
                if !inside(x, y + 1) {
                    edges.entry((x + 1, y + 1)).or_default().push((x, y + 1));
                    edge_count += 1;
                }
                if !inside(x - 1, y) {
                    edges.entry((x, y + 1)).or_default().push((x, y));
                    edge_count += 1;
                }
            }
        }

        if edge_count == 0 {
            return Err(AtlasError::ImageProcessing(format!(
                "label {label} not present on slice {slice}"
            )));
        }

        for ends in edges.values_mut() {
            ends.sort_unstable();
        }

        // Stitch directed edges into closed rings. Every corner has as many
        // outgoing as incoming edges, so each walk must return to its start.
        let mut rings: Vec<Vec<(i64, i64)>> = Vec::new();
        loop {
            let Some((&start, _)) = edges.iter().find(|(_, ends)| !ends.is_empty()) else {
                break;
            };
            let mut ring = vec![start];
            let mut current = start;
            loop {
                let next = match edges.get_mut(&current) {
                    Some(ends) if !ends.is_empty() => ends.remove(0),
                    _ => {
                        return Err(AtlasError::GeometricComputation(format!(
                            "open boundary at corner {current:?} for label {label} on slice {slice}"
                        )));
                    }
                };
                if next == start {
                    break;
                }
                ring.push(next);
                current = next;
            }
            rings.push(ring);
        }

        Ok(assemble_shapes(rings))
    }
}

/// Signed shoelace area in screen coordinates (y down); positive for rings
/// traced with the region on the left, negative for holes.
fn signed_area(ring: &[(i64, i64)]) -> f64 {
    let mut sum = 0i64;
    for i in 0..ring.len() {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % ring.len()];
        sum += x0 * y1 - x1 * y0;
    }
    sum as f64 / 2.0
}

fn to_points(ring: &[(i64, i64)]) -> Vec<[f32; 2]> {
    ring.iter().map(|&(x, y)| [x as f32, y as f32]).collect()
}

/// Split rings by orientation into exteriors and holes, then attach each hole
/// to the smallest exterior containing one of its corners.
fn assemble_shapes(rings: Vec<Vec<(i64, i64)>>) -> RegionPolygon {
    let mut exteriors: Vec<(RegionShape, f64)> = Vec::new();
    let mut holes: Vec<Vec<(i64, i64)>> = Vec::new();

    for ring in rings {
        let area = signed_area(&ring);
        if area >= 0.0 {
            let shape = RegionShape::new(to_points(&ring), Vec::new());
            exteriors.push((shape, area));
        } else {
            holes.push(ring);
        }
    }

    for hole in holes {
        let probe = Point::new(hole[0].0 as f32, hole[0].1 as f32);
        let owner = exteriors
            .iter()
            .enumerate()
            .filter(|(_, (shape, _))| shape.to_geo_polygon().contains(&probe))
            .min_by(|(_, (_, a)), (_, (_, b))| a.total_cmp(b))
            .map(|(index, _)| index)
            // A hole pinched against its exterior falls back to the largest one
            .or_else(|| {
                exteriors
                    .iter()
                    .enumerate()
                    .max_by(|(_, (_, a)), (_, (_, b))| a.total_cmp(b))
                    .map(|(index, _)| index)
            });
        if let Some(index) = owner {
            exteriors[index].0.holes.push(to_points(&hole));
        }
    }

    RegionPolygon::new(exteriors.into_iter().map(|(shape, _)| shape).collect())
}

/// Imageproc-based rasterizer. Contours follow boundary pixel centres, so the
/// outline is a half-pixel tighter than the true pixel edges; faster on large
/// slices than the exact tracer.
#[derive(Debug, Clone, Default)]
pub struct ImageprocContourRasterizer;

impl RegionRasterizer for ImageprocContourRasterizer {
    fn rasterize(
        &self,
        volume: &dyn LabelSource,
        slice: u32,
        label: i32,
    ) -> Result<RegionPolygon> {
        use imageproc::contours::{find_contours, BorderType};

        let mut mask = GrayImage::new(volume.width(), volume.height());
        let mut present = false;
        for y in 0..volume.height() {
            for x in 0..volume.width() {
                if volume.label(x, y, slice) == label {
                    mask.put_pixel(x, y, Luma([255u8]));
                    present = true;
                }
            }
        }
        if !present {
            return Err(AtlasError::ImageProcessing(format!(
                "label {label} not present on slice {slice}"
            )));
        }

        let contours = find_contours::<i32>(&mask);
        if contours.is_empty() {
            return Err(AtlasError::ImageProcessing(format!(
                "no contour found for label {label} on slice {slice}"
            )));
        }

        // Outer contours become shapes; hole contours attach to their parent
        let mut shape_index: BTreeMap<usize, usize> = BTreeMap::new();
        let mut shapes: Vec<RegionShape> = Vec::new();
        for (index, contour) in contours.iter().enumerate() {
            if contour.border_type == BorderType::Outer {
                let exterior = contour
                    .points
                    .iter()
                    .map(|p| [p.x as f32, p.y as f32])
                    .collect();
                shape_index.insert(index, shapes.len());
                shapes.push(RegionShape::new(exterior, Vec::new()));
            }
        }
        for contour in &contours {
            if contour.border_type == BorderType::Hole {
                if let Some(&owner) = contour.parent.as_ref().and_then(|p| shape_index.get(p)) {
                    shapes[owner].holes.push(
                        contour
                            .points
                            .iter()
                            .map(|p| [p.x as f32, p.y as f32])
                            .collect(),
                    );
                }
            }
        }

        Ok(RegionPolygon::new(shapes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::LabelVolume;

    fn volume_with_square() -> LabelVolume {
        let mut volume = LabelVolume::new(8, 8, 1);
        for y in 2..6 {
            for x in 2..6 {
                volume.set_label(x, y, 1, 7);
            }
        }
        volume
    }

    #[test]
    fn test_pixel_edge_square() {
        let volume = volume_with_square();
        let polygon = PixelEdgeRasterizer
            .rasterize(&volume, 1, 7)
            .expect("Should rasterize the square");

        assert_eq!(polygon.shapes.len(), 1);
        assert_eq!(polygon.area(), 16.0);
        assert_eq!(polygon.covered_voxels().len(), 16);
        assert!(polygon.contains_voxel(2, 2));
        assert!(!polygon.contains_voxel(1, 2));
    }

    #[test]
    fn test_pixel_edge_single_pixel() {
        let mut volume = LabelVolume::new(4, 4, 1);
        volume.set_label(3, 0, 1, 9);

        let polygon = PixelEdgeRasterizer
            .rasterize(&volume, 1, 9)
            .expect("Should rasterize a single pixel");

        assert_eq!(polygon.area(), 1.0);
        assert_eq!(polygon.covered_voxels(), vec![(3, 0)]);
    }

    #[test]
    fn test_pixel_edge_detects_hole() {
        let mut volume = volume_with_square();
        volume.set_label(3, 3, 1, 0);
        volume.set_label(4, 3, 1, 0);

        let polygon = PixelEdgeRasterizer
            .rasterize(&volume, 1, 7)
            .expect("Should rasterize the ring");

        assert_eq!(polygon.shapes.len(), 1);
        assert!(polygon.shapes[0].has_holes());
        assert_eq!(polygon.area(), 14.0);
        assert!(!polygon.contains_voxel(3, 3));
        assert_eq!(polygon.covered_voxels().len(), 14);
    }

    #[test]
    fn test_pixel_edge_disjoint_blobs() {
        let mut volume = LabelVolume::new(8, 8, 1);
        volume.set_label(0, 0, 1, 5);
        volume.set_label(6, 6, 1, 5);
        volume.set_label(7, 6, 1, 5);

        let polygon = PixelEdgeRasterizer
            .rasterize(&volume, 1, 5)
            .expect("Should rasterize both blobs");

        assert_eq!(polygon.shapes.len(), 2);
        assert_eq!(polygon.area(), 3.0);
    }

    #[test]
    fn test_missing_label_is_an_error() {
        let volume = volume_with_square();

        assert!(PixelEdgeRasterizer.rasterize(&volume, 1, 99).is_err());
        assert!(ImageprocContourRasterizer.rasterize(&volume, 1, 99).is_err());
    }

    #[test]
    fn test_imageproc_contour_square() {
        let volume = volume_with_square();
        let polygon = ImageprocContourRasterizer
            .rasterize(&volume, 1, 7)
            .expect("Should rasterize the square");

        assert_eq!(polygon.shapes.len(), 1);
        // Contours trace pixel centres: a 4x4 block outlines as a 3x3 square
        assert_eq!(polygon.area(), 9.0);
    }
}
