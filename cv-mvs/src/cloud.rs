use crate::fusion::{DisparityImage, DisparityParameters};
use crate::MvsError;
use cv_core::nalgebra::Point2;
use cv_core::{CameraModel, KeyPoint, Pose, Projective, WorldPoint, WorldToCamera};
use cv_pinhole::CameraIntrinsicsK1Distortion;
use rstar::RTree;

/// The shared point cloud accumulated across all accepted centers.
///
/// Points are append-only. `ranges` is a strictly increasing boundary list
/// with one entry per accepted center plus the leading zero, such that the
/// half-open range `[ranges[i], ranges[i + 1])` holds exactly the points
/// contributed while processing center `i`. A point that already exists
/// within `duplicate_tolerance` of an earlier point is never re-added, so a
/// later center that sees the same surface contributes nothing for it.
pub struct DisparityCloud {
    points: Vec<WorldPoint>,
    ranges: Vec<usize>,
    occupied: RTree<[f64; 3]>,
    duplicate_tolerance: f64,
}

impl Default for DisparityCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl DisparityCloud {
    pub fn new() -> Self {
        Self {
            points: vec![],
            ranges: vec![0],
            occupied: RTree::new(),
            duplicate_tolerance: 0.001,
        }
    }

    /// Sets the world-unit radius below which a new point is considered a
    /// duplicate of an existing one.
    pub fn duplicate_tolerance(self, duplicate_tolerance: f64) -> Self {
        Self {
            duplicate_tolerance,
            ..self
        }
    }

    pub fn reset(&mut self) {
        self.points.clear();
        self.ranges.clear();
        self.ranges.push(0);
        self.occupied = RTree::new();
    }

    /// Converts one center's fused disparity into world points and appends
    /// the new ones as the next center range.
    ///
    /// Validation happens before anything is mutated: on `Err` the cloud is
    /// exactly as it was, so a failed center can be rolled back by simply
    /// not recording it. Returns the number of points actually added, which
    /// may be zero when every point was already present.
    pub fn add_disparity(
        &mut self,
        disparity: &DisparityImage,
        world_to_view: WorldToCamera,
        parameters: &DisparityParameters,
        camera: &CameraIntrinsicsK1Distortion,
    ) -> Result<usize, MvsError> {
        let focal = camera.simple_intrinsics.focals.x;
        if !(parameters.baseline > 0.0) {
            return Err(MvsError::BadDisparity(format!(
                "baseline {} is not positive",
                parameters.baseline
            )));
        }
        if !(focal > 0.0) {
            return Err(MvsError::BadDisparity(format!(
                "focal length {} is not positive",
                focal
            )));
        }

        let view_to_world = world_to_view.inverse();
        let tolerance_squared = self.duplicate_tolerance * self.duplicate_tolerance;
        let mut added = 0;
        for y in 0..disparity.height() {
            for x in 0..disparity.width() {
                if !disparity.is_valid(x, y) {
                    continue;
                }
                let depth = match parameters.depth(disparity.get(x, y), focal) {
                    Some(depth) => depth,
                    None => continue,
                };
                let normalized = camera.calibrate(KeyPoint(Point2::new(x as f64, y as f64)));
                let world = view_to_world.transform(normalized.with_depth(depth));
                let euclidean = match world.point() {
                    Some(point) => point,
                    None => continue,
                };
                let key = [euclidean.x, euclidean.y, euclidean.z];
                if self
                    .occupied
                    .locate_within_distance(key, tolerance_squared)
                    .next()
                    .is_some()
                {
                    continue;
                }
                self.occupied.insert(key);
                self.points.push(world);
                added += 1;
            }
        }
        self.ranges.push(self.points.len());
        Ok(added)
    }

    pub fn points(&self) -> &[WorldPoint] {
        &self.points
    }

    /// The boundary list. `ranges()[0]` is always zero and the last entry
    /// always equals `len()`.
    pub fn ranges(&self) -> &[usize] {
        &self.ranges
    }

    /// The half-open point range contributed by the given accepted center.
    pub fn range(&self, center: usize) -> std::ops::Range<usize> {
        self.ranges[center]..self.ranges[center + 1]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
