//! Multi-view stereo on a scene whose camera poses and intrinsics are
//! already known.
//!
//! Given a [`StereoPairGraph`] describing which views form usable stereo
//! pairs, [`MultiViewStereo`] scores every view as a candidate "center" for
//! fused disparity computation, greedily selects a non-redundant subset of
//! centers, fuses disparity from each center's best neighbors, and merges
//! the results into one de-duplicated point cloud. [`colorize_cloud`] can
//! then sample a color for every point from the source imagery.
//!
//! The dense stereo matcher is pluggable through [`StereoDisparity`] and the
//! whole fusion stage through [`DisparityFusion`]; poses and intrinsics come
//! from bundle adjustment elsewhere.

mod cloud;
mod colorize;
mod coverage;
mod export;
mod fusion;
mod graph;
mod rectify;
mod settings;

pub use cloud::*;
pub use colorize::*;
pub use coverage::*;
pub use export::*;
pub use fusion::*;
pub use graph::*;
pub use rectify::*;
pub use settings::*;

use cv_core::{CameraToCamera, Pose, WorldToCamera};
use cv_pinhole::CameraIntrinsicsK1Distortion;
use float_ord::FloatOrd;
use image::{DynamicImage, GrayImage};
use itertools::Itertools;
use log::*;
use std::collections::HashMap;
use thiserror::Error;

/// Fatal input errors. Any of these aborts the run immediately; none of
/// them are retried.
#[derive(Debug, Error)]
pub enum MvsError {
    #[error("vertex '{0}' already exists in the stereo pair graph")]
    DuplicateVertex(String),
    #[error("unknown vertex '{0}' in the stereo pair graph")]
    UnknownVertex(String),
    #[error("quality3D {quality} between '{left}' and '{right}' is outside [0, 1]")]
    QualityOutOfRange {
        left: String,
        right: String,
        quality: f64,
    },
    #[error("vertex '{0}' is not an endpoint of the edge")]
    NotAnEndpoint(String),
    #[error("no image known for view '{0}'")]
    UnknownImage(String),
    #[error("scene has no view at SBA index {0}")]
    UnknownSbaIndex(usize),
    #[error("disparity rejected: {0}")]
    BadDisparity(String),
}

/// Retrieves images by view id. There can easily be too many images to keep
/// them all loaded at once, so the pipeline asks for them as needed.
pub trait LookUpImages {
    /// The dimensions of the view's image, without decoding the pixels.
    fn load_shape(&self, id: &str) -> Result<(u32, u32), MvsError>;
    /// The view's image.
    fn load_image(&self, id: &str) -> Result<DynamicImage, MvsError>;
}

/// The optimized scene: one entry per view with the parameters bundle
/// adjustment solved for.
#[derive(Debug, Clone, Default)]
pub struct SceneStructure {
    views: Vec<SceneView>,
}

/// Extrinsic and intrinsic parameters of one view.
#[derive(Debug, Clone, Copy)]
pub struct SceneView {
    pub camera: CameraIntrinsicsK1Distortion,
    pub world_to_view: WorldToCamera,
}

impl SceneStructure {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a view and returns its SBA index.
    pub fn add_view(&mut self, view: SceneView) -> usize {
        self.views.push(view);
        self.views.len() - 1
    }

    pub fn view(&self, index_sba: usize) -> Result<&SceneView, MvsError> {
        self.views.get(index_sba).ok_or(MvsError::UnknownSbaIndex(index_sba))
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Captures intermediate results before they are discarded. Purely
/// observational; nothing returned here influences the pipeline.
pub trait MvsListener {
    /// Called after a disparity image is computed for one stereo pair.
    fn pair_disparity(
        &mut self,
        _left: &str,
        _right: &str,
        _rectified_left: &GrayImage,
        _rectified_right: &GrayImage,
        _disparity: &DisparityImage,
        _parameters: &DisparityParameters,
    ) {
    }

    /// Called after the fused disparity image is computed for a center.
    fn fused_disparity(&mut self, _center: &str, _disparity: &DisparityImage, _parameters: &DisparityParameters) {}
}

/// Information on each view that is used to select and compute the
/// disparity images.
#[derive(Debug, Clone)]
pub struct ViewInfo {
    /// The view's id in the stereo pair graph.
    pub id: String,
    /// The view's vertex index in the stereo pair graph.
    pub vertex: usize,
    /// The view's index in the optimized scene.
    pub index_sba: usize,
    /// The shape of the original image.
    pub width: u32,
    pub height: u32,
    /// How good of a "center" view this view would be.
    pub score: f64,
    /// Set once the view has been excluded as redundant or consumed as a
    /// center. A used view can still serve as a neighbor of other centers.
    pub used: bool,
}

/// Creates a dense point cloud from multiple stereo pairs.
///
/// Where possible a single disparity image is fused from several stereo
/// pairs sharing one "center" view, which reduces noise through redundancy.
/// The point clouds of all centers are merged while skipping points that
/// are already present.
///
/// 1. Score every view for use as a center among its qualifying neighbors.
/// 2. Sort views by score, best first, and exclude redundant ones.
/// 3. Greedily fuse a disparity image for each remaining view from its best
///    neighbors and add the result to the common cloud.
///
/// One run must fully complete before another is started on the same
/// instance; the orchestrator reuses its scratch state across loop
/// iterations and is not reentrant. Calling [`MultiViewStereo::process`]
/// again starts a fresh run.
pub struct MultiViewStereo<F> {
    /// The settings for subsequent runs.
    pub settings: MvsSettings,
    fuser: F,
    listener: Option<Box<dyn MvsListener>>,
    coverage: ScoreViewCoverage,
    cloud: DisparityCloud,
    scores: Vec<ViewInfo>,
    map_scores: HashMap<String, usize>,
    index_sba_to_id: HashMap<usize, String>,
    pair_indexes: Vec<usize>,
    centers: Vec<usize>,
}

impl<F: DisparityFusion> MultiViewStereo<F> {
    pub fn new(fuser: F) -> Self {
        Self {
            settings: Default::default(),
            fuser,
            listener: None,
            coverage: Default::default(),
            cloud: DisparityCloud::new(),
            scores: vec![],
            map_scores: HashMap::new(),
            index_sba_to_id: HashMap::new(),
            pair_indexes: vec![],
            centers: vec![],
        }
    }

    /// Set the settings used by subsequent runs.
    pub fn settings(self, settings: MvsSettings) -> Self {
        Self { settings, ..self }
    }

    /// Attach a listener for intermediate results.
    pub fn listener(self, listener: impl MvsListener + 'static) -> Self {
        Self {
            listener: Some(Box::new(listener)),
            ..self
        }
    }

    /// Computes a point cloud given the known scene and a set of stereo
    /// pairs. All run state is reset at entry.
    pub fn process(
        &mut self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        pairs: &StereoPairGraph,
    ) -> Result<(), MvsError> {
        self.cloud = DisparityCloud::new().duplicate_tolerance(self.settings.duplicate_tolerance);
        self.coverage = ScoreViewCoverage::new(self.settings.coverage_grid_side);
        self.centers.clear();
        self.index_sba_to_id.clear();
        self.pair_indexes.clear();

        self.initialize_scores(scene, images, pairs)?;
        self.score_views(scene, pairs)?;

        // Sort views so the best center candidates come first. Ties fall
        // back to the id so runs are reproducible.
        self.scores
            .sort_by(|a, b| FloatOrd(b.score).cmp(&FloatOrd(a.score)).then_with(|| a.id.cmp(&b.id)));
        self.map_scores = self
            .scores
            .iter()
            .enumerate()
            .map(|(position, info)| (info.id.clone(), position))
            .collect();

        self.prune_similar_views(scene, pairs)?;

        for index in 0..self.scores.len() {
            if self.scores[index].used {
                continue;
            }
            debug!(
                "candidate center '{}' with score {:.3}",
                self.scores[index].id, self.scores[index].score
            );

            self.select_connected_views(pairs, self.scores[index].vertex)?;
            if self.pair_indexes.is_empty() {
                debug!("'{}' has no qualifying stereo pairs", self.scores[index].id);
                continue;
            }

            let center_sba = self.scores[index].index_sba;
            self.index_sba_to_id.insert(center_sba, self.scores[index].id.clone());
            match self.fuse_and_accumulate(scene, images, index) {
                Ok(added) => {
                    info!(
                        "center '{}' accepted with {} new points",
                        self.scores[index].id, added
                    );
                    self.scores[index].used = true;
                    self.centers.push(index);
                }
                Err(failure) => {
                    // Data-dependent failure; the candidate is skipped and
                    // stays available as a neighbor of later centers.
                    info!("center '{}' rejected: {}", self.scores[index].id, failure);
                    self.index_sba_to_id.remove(&center_sba);
                }
            }
        }
        info!(
            "run finished with {} centers and {} cloud points",
            self.centers.len(),
            self.cloud.len()
        );
        Ok(())
    }

    /// The finished point cloud of the last run.
    pub fn cloud(&self) -> &DisparityCloud {
        &self.cloud
    }

    /// The accepted centers of the last run, in acceptance order.
    pub fn list_centers(&self) -> impl Iterator<Item = &ViewInfo> + '_ {
        self.centers.iter().map(move |&index| &self.scores[index])
    }

    /// Every scored view of the last run, ranked best first.
    pub fn ranked_views(&self) -> &[ViewInfo] {
        &self.scores
    }

    /// Samples a color for every visible point of the last run's cloud.
    pub fn colorize(
        &self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        color: impl FnMut(usize, [u8; 3]),
    ) -> Result<(), MvsError> {
        colorize_cloud(scene, images, &self.cloud, self.list_centers(), color)
    }

    /// Creates a `ViewInfo` for every vertex in the graph and validates the
    /// vertex against the scene and image database.
    fn initialize_scores(
        &mut self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        pairs: &StereoPairGraph,
    ) -> Result<(), MvsError> {
        self.scores.clear();
        self.map_scores.clear();
        for (vertex_index, vertex) in pairs.vertices().iter().enumerate() {
            scene.view(vertex.index_sba)?;
            let (width, height) = images.load_shape(&vertex.id)?;
            self.scores.push(ViewInfo {
                id: vertex.id.clone(),
                vertex: vertex_index,
                index_sba: vertex.index_sba,
                width,
                height,
                score: -1.0,
                used: false,
            });
        }
        Ok(())
    }

    /// Computes the score for using each view as a center based on the
    /// rectified coverage and geometric quality of its neighbors.
    fn score_views(&mut self, scene: &SceneStructure, pairs: &StereoPairGraph) -> Result<(), MvsError> {
        for index in 0..self.scores.len() {
            // Until the array is sorted, position equals vertex index.
            let center = self.scores[index].clone();
            let center_view = *scene.view(center.index_sba)?;
            self.coverage.initialize(
                center.width,
                center.height,
                &DistortedToUndistorted::new(center_view.camera),
            );

            let vertex = pairs.vertex(center.vertex);
            let mut qualified = 0usize;
            for &edge_index in &vertex.pairs {
                let quality = pairs.edge(edge_index).quality_3d;
                // Sanity check, since this is hard to debug when done wrong.
                if !(0.0..=1.0).contains(&quality) {
                    let other = pairs.other(edge_index, center.vertex)?;
                    return Err(MvsError::QualityOutOfRange {
                        left: center.id.clone(),
                        right: pairs.vertex(other).id.clone(),
                        quality,
                    });
                }
                if quality < self.settings.minimum_quality_3d {
                    continue;
                }

                let other = pairs.other(edge_index, center.vertex)?;
                let info = &self.scores[other];
                let other_view = scene.view(info.index_sba)?;
                let relative: CameraToCamera = (other_view.world_to_view.isometry()
                    * center_view.world_to_view.isometry().inverse())
                .into();
                let mapping = UndistortedToRectified::new(&center_view.camera, &other_view.camera, relative);
                self.coverage.add_view(info.width, info.height, &mapping, quality as f32);
                qualified += 1;
            }
            self.coverage.process();
            self.scores[index].score = self.coverage.score();
            debug!(
                "view '{}' scored {:.3} from {}/{} qualifying pairs",
                center.id,
                self.scores[index].score,
                qualified,
                vertex.pairs.len()
            );
        }
        Ok(())
    }

    /// Marks a view as used when most of its rectified footprint is covered
    /// by a neighbor with a better score. Single pass; views pruned earlier
    /// in the pass no longer absorb anyone.
    fn prune_similar_views(&mut self, scene: &SceneStructure, pairs: &StereoPairGraph) -> Result<(), MvsError> {
        for rank in 0..self.scores.len() {
            let center = self.scores[rank].clone();
            let center_view = *scene.view(center.index_sba)?;
            self.coverage.initialize(
                center.width,
                center.height,
                &DistortedToUndistorted::new(center_view.camera),
            );

            let vertex = pairs.vertex(center.vertex);
            let mut absorbed_by = None;
            for &edge_index in &vertex.pairs {
                let other = pairs.other(edge_index, center.vertex)?;
                let other_id = &pairs.vertex(other).id;
                let position = *self
                    .map_scores
                    .get(other_id)
                    .expect("graph vertex missing from score table");
                let info = self.scores[position].clone();

                // An already pruned view cannot absorb this one.
                if info.used {
                    continue;
                }
                // Only neighbors that scored at least as well may absorb it.
                if info.score < center.score {
                    continue;
                }
                // Equal scores usually mean near-identical images. Break the
                // tie by id so exactly one of the two is excluded no matter
                // the processing order.
                if info.score == center.score && info.id < center.id {
                    continue;
                }

                let other_view = scene.view(info.index_sba)?;
                let relative: CameraToCamera = (other_view.world_to_view.isometry()
                    * center_view.world_to_view.isometry().inverse())
                .into();
                let mapping = UndistortedToRectified::new(&center_view.camera, &other_view.camera, relative);
                let intersection = self.coverage.fraction_intersection(info.width, info.height, &mapping);
                if intersection > self.settings.maximum_center_overlap {
                    absorbed_by = Some((info.id, intersection));
                    break;
                }
            }
            if let Some((other_id, intersection)) = absorbed_by {
                debug!(
                    "excluding '{}' as redundant with '{}' (intersection {:.2})",
                    center.id, other_id, intersection
                );
                self.scores[rank].used = true;
            }
        }
        Ok(())
    }

    /// Collects the neighbors used to fuse a disparity for the given center
    /// vertex: qualifying edges only, best 3D quality first, bounded by the
    /// fan-in cap.
    fn select_connected_views(&mut self, pairs: &StereoPairGraph, vertex_index: usize) -> Result<(), MvsError> {
        self.index_sba_to_id.clear();
        self.pair_indexes.clear();

        let vertex = pairs.vertex(vertex_index);
        let mut qualified = Vec::with_capacity(vertex.pairs.len());
        for &edge_index in &vertex.pairs {
            let quality = pairs.edge(edge_index).quality_3d;
            if quality < self.settings.minimum_quality_3d {
                continue;
            }
            qualified.push((quality, pairs.other(edge_index, vertex_index)?));
        }
        // The cap bounds the cost of fusion. It does not consider geometric
        // diversity: five near-identical high quality neighbors will fill
        // all five slots.
        let selected = qualified
            .into_iter()
            .sorted_by(|a, b| {
                FloatOrd(b.0)
                    .cmp(&FloatOrd(a.0))
                    .then_with(|| pairs.vertex(a.1).id.cmp(&pairs.vertex(b.1).id))
            })
            .take(self.settings.max_combine_pairs)
            .collect_vec();
        for (_, other) in selected {
            let other_vertex = pairs.vertex(other);
            self.index_sba_to_id.insert(other_vertex.index_sba, other_vertex.id.clone());
            self.pair_indexes.push(other_vertex.index_sba);
        }
        Ok(())
    }

    /// Fuses the disparity for one candidate center and folds the result
    /// into the common cloud. Any error here is data dependent and only
    /// rejects this candidate.
    fn fuse_and_accumulate(
        &mut self,
        scene: &SceneStructure,
        images: &dyn LookUpImages,
        index: usize,
    ) -> Result<usize, FusionError> {
        let center_sba = self.scores[index].index_sba;
        let center_id = self.scores[index].id.clone();

        let fused = {
            let Self {
                fuser,
                listener,
                index_sba_to_id,
                pair_indexes,
                ..
            } = self;
            let mut observer = |left: usize,
                                right: usize,
                                rectified_left: &GrayImage,
                                rectified_right: &GrayImage,
                                disparity: &DisparityImage,
                                parameters: &DisparityParameters| {
                if let Some(listener) = listener.as_deref_mut() {
                    let left_id = index_sba_to_id.get(&left).map(String::as_str).unwrap_or("");
                    let right_id = index_sba_to_id.get(&right).map(String::as_str).unwrap_or("");
                    listener.pair_disparity(
                        left_id,
                        right_id,
                        rectified_left,
                        rectified_right,
                        disparity,
                        parameters,
                    );
                }
            };
            fuser.fuse_disparity(
                scene,
                images,
                index_sba_to_id,
                center_sba,
                pair_indexes,
                &mut observer,
            )?
        };

        if let Some(listener) = self.listener.as_deref_mut() {
            listener.fused_disparity(&center_id, &fused.disparity, &fused.parameters);
        }

        let view = *scene
            .view(center_sba)
            .expect("scene index was validated at initialization");
        self.cloud
            .add_disparity(&fused.disparity, view.world_to_view, &fused.parameters, &view.camera)
            .map_err(|error| FusionError::Cloud(error.to_string()))
    }
}
