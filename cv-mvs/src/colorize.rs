use crate::cloud::DisparityCloud;
use crate::rectify;
use crate::{LookUpImages, MvsError, SceneStructure, ViewInfo};
use cv_core::nalgebra::{Point2, Vector4};
use cv_core::{Pose, Projective};
use cv_pinhole::NormalizedKeyPoint;
use image::Rgb;
use log::*;

/// Samples an RGB color for every visible cloud point.
///
/// Each accepted center is visited in acceptance order and every point in
/// its cloud range is reprojected into that center's image. Points behind
/// the camera or outside the image after rounding are silently skipped;
/// everything else is reported as `(point index, [r, g, b])` through the
/// callback. Since every point belongs to exactly one center's range, no
/// point is colorized twice.
pub fn colorize_cloud<'a>(
    scene: &SceneStructure,
    images: &dyn LookUpImages,
    cloud: &DisparityCloud,
    centers: impl IntoIterator<Item = &'a ViewInfo>,
    mut color: impl FnMut(usize, [u8; 3]),
) -> Result<(), MvsError> {
    for (center_index, center) in centers.into_iter().enumerate() {
        let image = images.load_image(&center.id)?.to_rgb8();
        let (width, height) = image.dimensions();
        let view = scene.view(center.index_sba)?;
        let mut emitted = 0usize;
        for point_index in cloud.range(center_index) {
            let camera_point = view.world_to_view.transform(cloud.points()[point_index]);
            let homogeneous = camera_point.homogeneous();
            if behind_camera(&homogeneous) {
                continue;
            }
            let normalized = NormalizedKeyPoint(Point2::new(
                homogeneous.x / homogeneous.z,
                homogeneous.y / homogeneous.z,
            ));
            let pixel = rectify::uncalibrate(&view.camera, normalized);
            let x = pixel.x.round();
            let y = pixel.y.round();
            if x < 0.0 || y < 0.0 || x >= width as f64 || y >= height as f64 {
                continue;
            }
            let Rgb(rgb) = *image.get_pixel(x as u32, y as u32);
            color(point_index, rgb);
            emitted += 1;
        }
        debug!(
            "colorized {} of {} points from center '{}'",
            emitted,
            cloud.range(center_index).len(),
            center.id
        );
    }
    Ok(())
}

/// A point is behind the camera when its depth and homogeneous weight
/// components disagree in sign (or the depth vanishes).
fn behind_camera(point: &Vector4<f64>) -> bool {
    !point.z.is_finite() || point.z * point.w <= 0.0
}
