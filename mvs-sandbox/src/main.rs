use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3, Rotation3, Translation3, Vector2, Vector3};
use cv_core::{CameraModel, KeyPoint, Pose, Projective, WorldToCamera};
use cv_mvs::{
    export_ply, DisparityImage, DisparityParameters, ExportCamera, FusionError, LookUpImages,
    MedianDisparityFusion, MultiViewStereo, MvsError, MvsSettings, SceneStructure, SceneView,
    StereoDisparity, StereoPairGraph,
};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK1Distortion};
use image::{DynamicImage, GrayImage, Luma};
use log::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "mvs-sandbox",
    about = "Runs multi-view stereo over a synthetic planar scene and exports the point cloud"
)]
struct Opt {
    /// Number of views in the camera rig
    #[structopt(long, default_value = "4")]
    views: usize,
    /// Image width in pixels
    #[structopt(long, default_value = "240")]
    width: u32,
    /// Image height in pixels
    #[structopt(long, default_value = "180")]
    height: u32,
    /// Focal length in pixels
    #[structopt(long, default_value = "120.0")]
    focal: f64,
    /// The K1 radial distortion of the synthetic cameras
    #[structopt(long, default_value = "-0.02")]
    radial_distortion: f64,
    /// Distance from the rig to the textured plane
    #[structopt(long, default_value = "3.0")]
    plane_z: f64,
    /// Distance between adjacent cameras
    #[structopt(long, default_value = "0.15")]
    spacing: f64,
    /// Disparity search range of the block matcher
    #[structopt(long, default_value = "48")]
    disparity_range: u32,
    /// Redundancy threshold; a translation-only rig fully overlaps at
    /// infinity, so pruning is disabled by default
    #[structopt(long, default_value = "1.0")]
    maximum_center_overlap: f64,
    /// Output PLY file for the colored point cloud
    #[structopt(short, long, default_value = "mvs-cloud.ply")]
    output: PathBuf,
}

/// Renders views of a textured plane at z = `plane_z` on demand.
struct PlanarLookUp {
    scene: SceneStructure,
    width: u32,
    height: u32,
    plane_z: f64,
    texture: Vec<u8>,
}

const TEXTURE_SIDE: usize = 512;

impl PlanarLookUp {
    fn new(scene: SceneStructure, opt: &Opt) -> Self {
        // Band-limited noise so block matching has texture to lock onto.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let texture = (0..TEXTURE_SIDE * TEXTURE_SIDE)
            .map(|index| {
                let (u, v) = ((index % TEXTURE_SIDE) as f64, (index / TEXTURE_SIDE) as f64);
                let smooth = 96.0 + 48.0 * (u * 0.11).sin() + 48.0 * (v * 0.07).sin();
                (smooth + rng.gen_range(-32.0..32.0)).clamp(0.0, 255.0) as u8
            })
            .collect();
        Self {
            scene,
            width: opt.width,
            height: opt.height,
            plane_z: opt.plane_z,
            texture,
        }
    }

    fn sample(&self, x: f64, y: f64) -> u8 {
        let u = (x * 60.0).rem_euclid(TEXTURE_SIDE as f64) as usize % TEXTURE_SIDE;
        let v = (y * 60.0).rem_euclid(TEXTURE_SIDE as f64) as usize % TEXTURE_SIDE;
        self.texture[v * TEXTURE_SIDE + u]
    }

    fn view_index(&self, id: &str) -> Result<usize, MvsError> {
        id.strip_prefix("view=")
            .and_then(|index| index.parse().ok())
            .filter(|&index| index < self.scene.len())
            .ok_or_else(|| MvsError::UnknownImage(id.to_string()))
    }
}

impl LookUpImages for PlanarLookUp {
    fn load_shape(&self, id: &str) -> Result<(u32, u32), MvsError> {
        self.view_index(id)?;
        Ok((self.width, self.height))
    }

    fn load_image(&self, id: &str) -> Result<DynamicImage, MvsError> {
        let view = *self.scene.view(self.view_index(id)?)?;
        let view_to_world = view.world_to_view.inverse();
        let origin = view_to_world.isometry().translation.vector;
        let mut image = GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let normalized = view.camera.calibrate(KeyPoint(Point2::new(x as f64, y as f64)));
                let direction =
                    view_to_world.isometry().rotation * Vector3::new(normalized.x, normalized.y, 1.0);
                let pixel = if direction.z > 1e-9 {
                    let reach = (self.plane_z - origin.z) / direction.z;
                    let world = origin + direction * reach;
                    self.sample(world.x, world.y)
                } else {
                    0
                };
                image.put_pixel(x, y, Luma([pixel]));
            }
        }
        Ok(DynamicImage::ImageLuma8(image))
    }
}

/// A small sum-of-absolute-differences block matcher for the demo. Real
/// applications plug in a dense stereo algorithm here.
struct BlockMatch {
    radius: u32,
    range: u32,
    max_average_error: f32,
}

impl StereoDisparity for BlockMatch {
    fn disparity(
        &mut self,
        rectified_left: &GrayImage,
        rectified_right: &GrayImage,
    ) -> Result<(DisparityImage, DisparityParameters), FusionError> {
        let (width, height) = rectified_left.dimensions();
        if rectified_right.dimensions() != (width, height) {
            return Err(FusionError::Matcher("rectified pair dimensions differ".to_string()));
        }
        let radius = self.radius;
        let area = ((2 * radius + 1) * (2 * radius + 1)) as f32;
        let mut disparity = DisparityImage::new(width, height);
        if width < 2 * radius + 1 || height < 2 * radius + 1 {
            return Err(FusionError::Matcher("images smaller than the match window".to_string()));
        }
        for y in radius..height - radius {
            for x in radius..width - radius {
                let mut best = (0u32, f32::INFINITY);
                for d in 0..=self.range.min(x - radius) {
                    let mut error = 0.0f32;
                    for wy in y - radius..=y + radius {
                        for wx in x - radius..=x + radius {
                            let left = rectified_left.get_pixel(wx, wy).0[0] as f32;
                            let right = rectified_right.get_pixel(wx - d, wy).0[0] as f32;
                            error += (left - right).abs();
                        }
                    }
                    if error < best.1 {
                        best = (d, error);
                    }
                }
                if best.1 / area <= self.max_average_error && best.0 > 0 {
                    disparity.set(x, y, best.0 as f32);
                }
            }
        }
        Ok((
            disparity,
            DisparityParameters {
                disparity_min: 0.0,
                disparity_range: (self.range + 1) as f64,
                baseline: 0.0,
            },
        ))
    }
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let camera = CameraIntrinsicsK1Distortion::new(
        CameraIntrinsics {
            focals: Vector2::new(opt.focal, opt.focal),
            principal_point: Point2::new(opt.width as f64 / 2.0, opt.height as f64 / 2.0),
            skew: 0.0,
        },
        opt.radial_distortion,
    );

    // A rig of translated cameras all looking down +z at the plane.
    let mut scene = SceneStructure::new();
    for index in 0..opt.views {
        let position = Vector3::new(index as f64 * opt.spacing, 0.0, 0.0);
        scene.add_view(SceneView {
            camera,
            world_to_view: WorldToCamera(IsometryMatrix3::from_parts(
                Translation3::from(-position),
                Rotation3::identity(),
            )),
        });
    }

    let mut pairs = StereoPairGraph::new();
    for index in 0..opt.views {
        pairs
            .add_vertex(format!("view={}", index), index)
            .expect("view ids are unique");
    }
    for a in 0..opt.views {
        for b in a + 1..opt.views.min(a + 3) {
            // Nearby pairs triangulate better; fake a quality that decays
            // with camera distance.
            let quality = 0.9f64.powi((b - a) as i32);
            pairs
                .connect(&format!("view={}", a), &format!("view={}", b), quality)
                .expect("graph vertices exist");
        }
    }

    let images = PlanarLookUp::new(scene.clone(), &opt);

    let settings = MvsSettings {
        maximum_center_overlap: opt.maximum_center_overlap,
        // Merge points closer than roughly one pixel footprint on the plane.
        duplicate_tolerance: opt.plane_z / opt.focal,
        ..Default::default()
    };
    let mut mvs = MultiViewStereo::new(MedianDisparityFusion::new(BlockMatch {
        radius: 2,
        range: opt.disparity_range,
        max_average_error: 24.0,
    }))
    .settings(settings);

    info!("processing {} views", opt.views);
    mvs.process(&scene, &images, &pairs).expect("multi-view stereo failed");
    info!(
        "accepted {} centers and produced {} points",
        mvs.list_centers().count(),
        mvs.cloud().len()
    );

    info!("colorizing the cloud");
    let mut colors = vec![[128u8, 128, 128]; mvs.cloud().len()];
    mvs.colorize(&scene, &images, |index, rgb| colors[index] = rgb)
        .expect("colorization failed");

    info!("exporting {}", opt.output.display());
    let points_and_colors = mvs
        .cloud()
        .points()
        .iter()
        .zip(colors)
        .filter_map(|(point, color)| point.point().map(|point| (point, color)));
    let cameras: Vec<ExportCamera> = (0..opt.views)
        .map(|index| {
            let view_to_world = scene.view(index).expect("view exists").world_to_view.inverse();
            let isometry = view_to_world.isometry();
            ExportCamera {
                optical_center: Point3::from(isometry.translation.vector),
                forward_direction: isometry.rotation * Vector3::z(),
                up_direction: isometry.rotation * -Vector3::y(),
                focal_length: 0.05,
            }
        })
        .collect();
    let file = File::create(&opt.output).expect("failed to create output file");
    export_ply(BufWriter::new(file), points_and_colors, &cameras).expect("failed to write PLY");
}
