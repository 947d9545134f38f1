use cv_core::nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use cv_core::{CameraModel, CameraToCamera, KeyPoint, Pose};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK1Distortion, NormalizedKeyPoint};

/// A mapping between two pixel coordinate frames.
pub trait PixelTransform {
    fn transform(&self, x: f64, y: f64) -> (f64, f64);
}

/// Wraps a closure as a [`PixelTransform`], which lets tests and callers
/// substitute arbitrary mappings for the rectification below.
pub struct PixelMapFn<F>(pub F);

impl<F> PixelTransform for PixelMapFn<F>
where
    F: Fn(f64, f64) -> (f64, f64),
{
    fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        (self.0)(x, y)
    }
}

/// Projects a normalized image coordinate back to pixel coordinates.
///
/// The closed form in `CameraIntrinsicsK1Distortion::uncalibrate` divides by
/// `k1 * |p|^2`, which is indeterminate when either factor is zero, so those
/// cases go through the distortion-free intrinsics.
pub(crate) fn uncalibrate(camera: &CameraIntrinsicsK1Distortion, point: NormalizedKeyPoint) -> KeyPoint {
    if camera.k1 == 0.0 || point.coords.norm_squared() < 1e-12 {
        camera.simple_intrinsics.uncalibrate(point)
    } else {
        camera.uncalibrate(point)
    }
}

/// Maps a view's pixels into its own undistorted pixel frame.
///
/// This is the basis the coverage scorer is initialized with for a candidate
/// center view.
pub struct DistortedToUndistorted {
    camera: CameraIntrinsicsK1Distortion,
}

impl DistortedToUndistorted {
    pub fn new(camera: CameraIntrinsicsK1Distortion) -> Self {
        Self { camera }
    }
}

impl PixelTransform for DistortedToUndistorted {
    fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        let normalized = self.camera.calibrate(KeyPoint(Point2::new(x, y)));
        let pixel = self.camera.simple_intrinsics.uncalibrate(normalized);
        (pixel.x, pixel.y)
    }
}

/// Rotation-only reprojection from a center view's undistorted pixels into a
/// neighbor's rectified pixel frame.
///
/// Depth-free by construction, which is what footprint coverage and overlap
/// need. Directions that land behind the neighbor camera map to NaN so any
/// downstream bounds test rejects them.
pub struct UndistortedToRectified {
    rotation: Rotation3<f64>,
    center: CameraIntrinsics,
    view: CameraIntrinsics,
}

impl UndistortedToRectified {
    pub fn new(
        center: &CameraIntrinsicsK1Distortion,
        view: &CameraIntrinsicsK1Distortion,
        center_to_view: CameraToCamera,
    ) -> Self {
        Self {
            rotation: center_to_view.isometry().rotation,
            center: center.simple_intrinsics,
            view: view.simple_intrinsics,
        }
    }
}

impl PixelTransform for UndistortedToRectified {
    fn transform(&self, x: f64, y: f64) -> (f64, f64) {
        let normalized = self.center.calibrate(KeyPoint(Point2::new(x, y)));
        let rotated = self.rotation * Vector3::new(normalized.x, normalized.y, 1.0);
        if rotated.z <= 0.0 {
            return (f64::NAN, f64::NAN);
        }
        let pixel = self.view.uncalibrate(NormalizedKeyPoint(Point2::new(
            rotated.x / rotated.z,
            rotated.y / rotated.z,
        )));
        (pixel.x, pixel.y)
    }
}

/// Rotation taking the center camera frame into the baseline-aligned
/// rectified frame shared by a stereo pair.
///
/// Returns `None` when the baseline is degenerate or nearly parallel to the
/// optical axis, where this rectification is unstable.
pub(crate) fn rectifying_rotation(center_to_view: CameraToCamera) -> Option<Rotation3<f64>> {
    let isometry = center_to_view.isometry();
    // Optical center of the other view expressed in the center frame.
    let other_center = -(isometry.rotation.inverse() * isometry.translation.vector);
    let baseline = other_center.norm();
    if baseline < 1e-12 {
        return None;
    }
    let r1 = other_center / baseline;
    let r2 = Vector3::z().cross(&r1);
    let length = r2.norm();
    if length < 1e-6 {
        return None;
    }
    let r2 = r2 / length;
    let r3 = r1.cross(&r2);
    Some(Rotation3::from_matrix_unchecked(Matrix3::from_rows(&[
        r1.transpose(),
        r2.transpose(),
        r3.transpose(),
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{IsometryMatrix3, Translation3, Vector2};

    fn camera(k1: f64) -> CameraIntrinsicsK1Distortion {
        CameraIntrinsicsK1Distortion::new(
            CameraIntrinsics {
                focals: Vector2::new(80.0, 80.0),
                principal_point: Point2::new(50.0, 40.0),
                skew: 0.0,
            },
            k1,
        )
    }

    #[test]
    fn uncalibrate_handles_zero_distortion() {
        let cam = camera(0.0);
        let pixel = uncalibrate(&cam, NormalizedKeyPoint(Point2::new(0.1, -0.2)));
        assert!((pixel.x - 58.0).abs() < 1e-9);
        assert!((pixel.y - 24.0).abs() < 1e-9);
        // The principal point itself must not produce NaN either.
        let center = uncalibrate(&camera(-0.1), NormalizedKeyPoint(Point2::new(0.0, 0.0)));
        assert!((center.x - 50.0).abs() < 1e-9);
        assert!((center.y - 40.0).abs() < 1e-9);
    }

    #[test]
    fn identity_rotation_maps_pixels_onto_themselves() {
        let a = camera(0.0);
        let mapping = UndistortedToRectified::new(&a, &a, CameraToCamera(IsometryMatrix3::identity()));
        let (x, y) = mapping.transform(31.0, 57.0);
        assert!((x - 31.0).abs() < 1e-9);
        assert!((y - 57.0).abs() < 1e-9);
    }

    #[test]
    fn directions_behind_the_view_map_to_nan() {
        let a = camera(0.0);
        let half_turn = Rotation3::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI);
        let pose = CameraToCamera(IsometryMatrix3::from_parts(Translation3::identity(), half_turn));
        let mapping = UndistortedToRectified::new(&a, &a, pose);
        let (x, y) = mapping.transform(50.0, 40.0);
        assert!(x.is_nan() && y.is_nan());
    }

    #[test]
    fn sideways_baseline_rectifies_to_identity() {
        let pose = CameraToCamera(IsometryMatrix3::from_parts(
            Translation3::new(-0.3, 0.0, 0.0),
            Rotation3::identity(),
        ));
        let rotation = rectifying_rotation(pose).unwrap();
        assert!((rotation.matrix() - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn degenerate_baselines_are_refused() {
        // No baseline at all.
        assert!(rectifying_rotation(CameraToCamera(IsometryMatrix3::identity())).is_none());
        // Baseline along the optical axis.
        let forward = CameraToCamera(IsometryMatrix3::from_parts(
            Translation3::new(0.0, 0.0, -1.0),
            Rotation3::identity(),
        ));
        assert!(rectifying_rotation(forward).is_none());
    }
}
