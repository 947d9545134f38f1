use crate::rectify::{self, rectifying_rotation};
use crate::{LookUpImages, MvsError, SceneStructure};
use cv_core::nalgebra::{Point2, Rotation3, Vector3};
use cv_core::{CameraModel, CameraToCamera, KeyPoint, Pose};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK1Distortion, NormalizedKeyPoint};
use float_ord::FloatOrd;
use image::{GrayImage, Luma};
use log::*;
use std::collections::HashMap;
use thiserror::Error;

/// A disparity map with an explicit per-pixel validity mask.
#[derive(Debug, Clone)]
pub struct DisparityImage {
    width: u32,
    height: u32,
    values: Vec<f32>,
    valid: Vec<bool>,
}

impl DisparityImage {
    /// Creates an image with every pixel marked invalid.
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = (width * height) as usize;
        Self {
            width,
            height,
            values: vec![0.0; pixels],
            valid: vec![false; pixels],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[self.index(x, y)]
    }

    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        self.valid[self.index(x, y)]
    }

    /// Stores a value and marks the pixel valid.
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let index = self.index(x, y);
        self.values[index] = value;
        self.valid[index] = true;
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }
}

/// The geometry a disparity value is expressed against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisparityParameters {
    /// Offset added to every stored disparity value.
    pub disparity_min: f64,
    /// Number of representable disparity values.
    pub disparity_range: f64,
    /// Distance between the optical centers of the pair.
    pub baseline: f64,
}

impl DisparityParameters {
    /// Depth along the optical axis for a stored disparity value, or `None`
    /// when the total disparity is not positive.
    pub fn depth(&self, value: f32, focal: f64) -> Option<f64> {
        let disparity = self.disparity_min + value as f64;
        (disparity > 0.0).then(|| focal * self.baseline / disparity)
    }
}

/// One fused disparity image for a center view.
#[derive(Debug, Clone)]
pub struct FusedDisparity {
    pub disparity: DisparityImage,
    pub parameters: DisparityParameters,
}

/// Data-dependent fusion failures. These abort one candidate center, never
/// the whole run.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("no usable stereo pair among the selected neighbors")]
    NoUsablePairs,
    #[error("stereo matcher failed: {0}")]
    Matcher(String),
    #[error("fused disparity has no valid pixels")]
    EmptyDisparity,
    #[error("cloud accumulation failed: {0}")]
    Cloud(String),
    #[error(transparent)]
    Lookup(#[from] MvsError),
}

/// Computes a disparity map from one rectified stereo pair.
///
/// The dense matching algorithm itself lives outside this crate; rows of the
/// two images are epipolar-aligned by the caller.
pub trait StereoDisparity {
    fn disparity(
        &mut self,
        rectified_left: &GrayImage,
        rectified_right: &GrayImage,
    ) -> Result<(DisparityImage, DisparityParameters), FusionError>;
}

/// Fuses disparity from several neighbors of one center view into a single
/// disparity image over the center's pixels.
///
/// `names` maps SBA indices to view ids for image lookup, `neighbors` is
/// ordered best quality first, and `observer` is told about each pairwise
/// disparity so listeners can inspect intermediate results.
pub trait DisparityFusion {
    fn fuse_disparity(
        &mut self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        names: &HashMap<usize, String>,
        center: usize,
        neighbors: &[usize],
        observer: &mut dyn FnMut(usize, usize, &GrayImage, &GrayImage, &DisparityImage, &DisparityParameters),
    ) -> Result<FusedDisparity, FusionError>;
}

/// Default fusion: each neighbor forms an independent rectified pair with
/// the center, and the per-pixel fused disparity is the median of the
/// inverse depths observed for that center pixel.
pub struct MedianDisparityFusion<D> {
    matcher: D,
}

impl<D> MedianDisparityFusion<D> {
    pub fn new(matcher: D) -> Self {
        Self { matcher }
    }
}

impl<D: StereoDisparity> DisparityFusion for MedianDisparityFusion<D> {
    fn fuse_disparity(
        &mut self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        names: &HashMap<usize, String>,
        center: usize,
        neighbors: &[usize],
        observer: &mut dyn FnMut(usize, usize, &GrayImage, &GrayImage, &DisparityImage, &DisparityParameters),
    ) -> Result<FusedDisparity, FusionError> {
        let center_view = *scene.view(center)?;
        let center_name = names.get(&center).expect("center view missing from name table");
        let center_image = images.load_image(center_name)?.to_luma8();
        let (width, height) = center_image.dimensions();
        let camera = center_view.camera;
        let focal = camera.simple_intrinsics.focals.x;

        // Inverse depths observed per center pixel, across all pairs.
        let mut samples: Vec<Vec<f32>> = vec![vec![]; (width * height) as usize];
        let mut fused_baseline = 0.0f64;
        let mut usable_pairs = 0usize;

        for &neighbor in neighbors {
            let neighbor_view = *scene.view(neighbor)?;
            let relative: CameraToCamera = (neighbor_view.world_to_view.isometry()
                * center_view.world_to_view.isometry().inverse())
            .into();
            let rotation = match rectifying_rotation(relative) {
                Some(rotation) => rotation,
                None => {
                    debug!("pair {} -> {} has a degenerate baseline; skipping", center, neighbor);
                    continue;
                }
            };
            let baseline = relative.isometry().translation.vector.norm();

            let neighbor_name = names.get(&neighbor).expect("neighbor view missing from name table");
            let neighbor_image = images.load_image(neighbor_name)?.to_luma8();

            // Both images resampled into the baseline-aligned rectified frame,
            // which reuses the center's distortion-free intrinsics.
            let rectified_left = warp_to_rectified(
                &center_image,
                &camera,
                rotation.inverse(),
                width,
                height,
                &camera.simple_intrinsics,
            );
            let source_rotation = relative.isometry().rotation * rotation.inverse();
            let rectified_right = warp_to_rectified(
                &neighbor_image,
                &neighbor_view.camera,
                source_rotation,
                width,
                height,
                &camera.simple_intrinsics,
            );

            let (disparity, mut parameters) = match self.matcher.disparity(&rectified_left, &rectified_right) {
                Ok(result) => result,
                Err(error) => {
                    debug!("stereo matcher failed on pair {} -> {}: {}", center, neighbor, error);
                    continue;
                }
            };
            parameters.baseline = baseline;
            observer(center, neighbor, &rectified_left, &rectified_right, &disparity, &parameters);
            usable_pairs += 1;
            fused_baseline = fused_baseline.max(baseline);

            // Fold the pair's valid disparities into center-frame inverse depths.
            let back = rotation.inverse();
            for y in 0..disparity.height().min(height) {
                for x in 0..disparity.width().min(width) {
                    if !disparity.is_valid(x, y) {
                        continue;
                    }
                    let depth = match parameters.depth(disparity.get(x, y), focal) {
                        Some(depth) => depth,
                        None => continue,
                    };
                    let normalized = camera
                        .simple_intrinsics
                        .calibrate(KeyPoint(Point2::new(x as f64, y as f64)));
                    let rectified_point = Vector3::new(normalized.x * depth, normalized.y * depth, depth);
                    let center_point = back * rectified_point;
                    if center_point.z <= 0.0 {
                        continue;
                    }
                    let pixel = rectify::uncalibrate(
                        &camera,
                        NormalizedKeyPoint(Point2::new(
                            center_point.x / center_point.z,
                            center_point.y / center_point.z,
                        )),
                    );
                    let px = pixel.x.round();
                    let py = pixel.y.round();
                    if px < 0.0 || py < 0.0 || px >= width as f64 || py >= height as f64 {
                        continue;
                    }
                    samples[(py as u32 * width + px as u32) as usize].push((1.0 / center_point.z) as f32);
                }
            }
        }

        if usable_pairs == 0 {
            return Err(FusionError::NoUsablePairs);
        }

        // Median inverse depth per pixel, re-encoded against the widest pair
        // baseline so the fused values stay in a familiar disparity scale.
        let mut fused = DisparityImage::new(width, height);
        let mut largest = 0.0f64;
        let mut fused_pixels = 0usize;
        for y in 0..height {
            for x in 0..width {
                let list = &mut samples[(y * width + x) as usize];
                if list.is_empty() {
                    continue;
                }
                list.sort_unstable_by_key(|&inverse| FloatOrd(inverse));
                let median = list[list.len() / 2] as f64;
                let value = focal * fused_baseline * median;
                fused.set(x, y, value as f32);
                largest = largest.max(value);
                fused_pixels += 1;
            }
        }
        if fused_pixels == 0 {
            return Err(FusionError::EmptyDisparity);
        }
        debug!(
            "fused {} pairs into {} valid pixels for center {}",
            usable_pairs, fused_pixels, center
        );
        Ok(FusedDisparity {
            disparity: fused,
            parameters: DisparityParameters {
                disparity_min: 0.0,
                disparity_range: largest + 1.0,
                baseline: fused_baseline,
            },
        })
    }
}

/// Resamples a source image into the rectified frame.
///
/// `rect_to_source` rotates rectified-frame directions into the source
/// camera frame; pixels with no source sample come out black.
fn warp_to_rectified(
    source: &GrayImage,
    source_camera: &CameraIntrinsicsK1Distortion,
    rect_to_source: Rotation3<f64>,
    width: u32,
    height: u32,
    rect_intrinsics: &CameraIntrinsics,
) -> GrayImage {
    let (source_width, source_height) = source.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let normalized = rect_intrinsics.calibrate(KeyPoint(Point2::new(x as f64, y as f64)));
        let direction = rect_to_source * Vector3::new(normalized.x, normalized.y, 1.0);
        if direction.z <= 0.0 {
            return Luma([0]);
        }
        let pixel = rectify::uncalibrate(
            source_camera,
            NormalizedKeyPoint(Point2::new(direction.x / direction.z, direction.y / direction.z)),
        );
        let sx = pixel.x.round();
        let sy = pixel.y.round();
        if sx >= 0.0 && sx < source_width as f64 && sy >= 0.0 && sy < source_height as f64 {
            *source.get_pixel(sx as u32, sy as u32)
        } else {
            Luma([0])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SceneView;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3, Vector2};
    use cv_core::WorldToCamera;
    use image::DynamicImage;
    use maplit::hashmap;

    struct FlatImages {
        width: u32,
        height: u32,
    }

    impl LookUpImages for FlatImages {
        fn load_shape(&self, _id: &str) -> Result<(u32, u32), MvsError> {
            Ok((self.width, self.height))
        }

        fn load_image(&self, _id: &str) -> Result<DynamicImage, MvsError> {
            Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(
                self.width,
                self.height,
                Luma([128]),
            )))
        }
    }

    /// Reports the same disparity for every pixel.
    struct ConstantMatcher {
        value: f32,
    }

    impl StereoDisparity for ConstantMatcher {
        fn disparity(
            &mut self,
            rectified_left: &GrayImage,
            _rectified_right: &GrayImage,
        ) -> Result<(DisparityImage, DisparityParameters), FusionError> {
            let (width, height) = rectified_left.dimensions();
            let mut disparity = DisparityImage::new(width, height);
            for y in 0..height {
                for x in 0..width {
                    disparity.set(x, y, self.value);
                }
            }
            Ok((
                disparity,
                DisparityParameters {
                    disparity_min: 0.0,
                    disparity_range: 64.0,
                    baseline: 0.0,
                },
            ))
        }
    }

    fn camera() -> CameraIntrinsicsK1Distortion {
        CameraIntrinsicsK1Distortion::new(
            CameraIntrinsics {
                focals: Vector2::new(50.0, 50.0),
                principal_point: Point2::new(50.0, 40.0),
                skew: 0.0,
            },
            0.0,
        )
    }

    #[test]
    fn sideways_pair_fuses_to_the_pairwise_disparity() {
        let mut scene = SceneStructure::new();
        scene.add_view(SceneView {
            camera: camera(),
            world_to_view: WorldToCamera(IsometryMatrix3::identity()),
        });
        scene.add_view(SceneView {
            camera: camera(),
            world_to_view: WorldToCamera(IsometryMatrix3::from_parts(
                Translation3::new(-0.3, 0.0, 0.0),
                Rotation3::identity(),
            )),
        });
        let images = FlatImages { width: 100, height: 80 };
        let names = hashmap! {
            0 => "a".to_string(),
            1 => "b".to_string(),
        };

        // Plane at depth 2: disparity = focal * baseline / depth = 7.5.
        let mut fusion = MedianDisparityFusion::new(ConstantMatcher { value: 7.5 });
        let mut pairs = vec![];
        let fused = fusion
            .fuse_disparity(&scene, &images, &names, 0, &[1], &mut |left, right, _, _, _, parameters| {
                pairs.push((left, right, parameters.baseline));
            })
            .unwrap();

        assert_eq!(pairs, vec![(0, 1, 0.3)]);
        assert_eq!(fused.parameters.baseline, 0.3);
        assert_eq!(fused.parameters.disparity_min, 0.0);
        // The rectified frame coincides with the center frame, so the fused
        // disparity should reproduce the matcher's value.
        assert!(fused.disparity.is_valid(50, 40));
        assert!((fused.disparity.get(50, 40) - 7.5).abs() < 1e-3);
        let depth = fused.parameters.depth(fused.disparity.get(50, 40), 50.0).unwrap();
        assert!((depth - 2.0).abs() < 1e-3);
    }

    #[test]
    fn degenerate_neighbors_fail_fusion() {
        let mut scene = SceneStructure::new();
        // Identical poses leave no baseline to rectify against.
        for _ in 0..2 {
            scene.add_view(SceneView {
                camera: camera(),
                world_to_view: WorldToCamera(IsometryMatrix3::identity()),
            });
        }
        let images = FlatImages { width: 100, height: 80 };
        let names = hashmap! {
            0 => "a".to_string(),
            1 => "b".to_string(),
        };
        let mut fusion = MedianDisparityFusion::new(ConstantMatcher { value: 5.0 });
        let result = fusion.fuse_disparity(&scene, &images, &names, 0, &[1], &mut |_, _, _, _, _, _| {});
        assert!(matches!(result, Err(FusionError::NoUsablePairs)));
    }
}
