use cv_core::nalgebra::{IsometryMatrix3, Point2, Rotation3, Translation3, Vector2, Vector3};
use cv_core::WorldToCamera;
use cv_mvs::{
    DisparityFusion, DisparityImage, DisparityParameters, FusedDisparity, FusionError, LookUpImages,
    MultiViewStereo, MvsError, MvsListener, MvsSettings, SceneStructure, SceneView, StereoPairGraph,
};
use cv_pinhole::{CameraIntrinsics, CameraIntrinsicsK1Distortion};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

const WIDTH: u32 = 100;
const HEIGHT: u32 = 80;

fn camera() -> CameraIntrinsicsK1Distortion {
    CameraIntrinsicsK1Distortion::new(
        CameraIntrinsics {
            focals: Vector2::new(50.0, 50.0),
            principal_point: Point2::new(50.0, 40.0),
            skew: 0.0,
        },
        -0.01,
    )
}

/// A view yawed about the vertical axis and offset along x.
fn view(yaw: f64, x: f64) -> SceneView {
    let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw);
    SceneView {
        camera: camera(),
        world_to_view: WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::from(-(rotation * Vector3::new(x, 0.0, 0.0))),
            rotation,
        )),
    }
}

struct FlatImages;

impl LookUpImages for FlatImages {
    fn load_shape(&self, _id: &str) -> Result<(u32, u32), MvsError> {
        Ok((WIDTH, HEIGHT))
    }

    fn load_image(&self, _id: &str) -> Result<DynamicImage, MvsError> {
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            WIDTH,
            HEIGHT,
            Rgb([9, 9, 9]),
        )))
    }
}

type Calls = Rc<RefCell<Vec<(usize, Vec<usize>)>>>;

/// Stands in for the disparity fusion collaborator: records what it was
/// asked to fuse and emits three valid pixels whose depth depends on the
/// center, so every center contributes distinct points.
struct RecordingFusion {
    calls: Calls,
    fail_for: HashSet<usize>,
}

impl RecordingFusion {
    fn new(calls: &Calls) -> Self {
        Self {
            calls: Rc::clone(calls),
            fail_for: HashSet::new(),
        }
    }

    fn failing_for(calls: &Calls, fail_for: impl IntoIterator<Item = usize>) -> Self {
        Self {
            calls: Rc::clone(calls),
            fail_for: fail_for.into_iter().collect(),
        }
    }
}

impl DisparityFusion for RecordingFusion {
    fn fuse_disparity(
        &mut self,
        _scene: &SceneStructure,
        _images: &dyn LookUpImages,
        _names: &HashMap<usize, String>,
        center: usize,
        neighbors: &[usize],
        observer: &mut dyn FnMut(usize, usize, &GrayImage, &GrayImage, &DisparityImage, &DisparityParameters),
    ) -> Result<FusedDisparity, FusionError> {
        self.calls.borrow_mut().push((center, neighbors.to_vec()));
        if self.fail_for.contains(&center) {
            return Err(FusionError::NoUsablePairs);
        }
        let parameters = DisparityParameters {
            disparity_min: 0.0,
            disparity_range: 100.0,
            baseline: 0.1,
        };
        let rectified = GrayImage::new(1, 1);
        let mut pair = DisparityImage::new(1, 1);
        pair.set(0, 0, 1.0);
        for &neighbor in neighbors {
            observer(center, neighbor, &rectified, &rectified, &pair, &parameters);
        }
        let mut disparity = DisparityImage::new(3, 1);
        for x in 0..3 {
            disparity.set(x, 0, (center + 1) as f32);
        }
        Ok(FusedDisparity { disparity, parameters })
    }
}

/// Three views in a row: the outer two only see the middle one well.
fn abc_scene() -> (SceneStructure, StereoPairGraph) {
    let mut scene = SceneStructure::new();
    scene.add_view(view(-0.5, 0.0));
    scene.add_view(view(0.0, 0.2));
    scene.add_view(view(0.5, 0.4));
    let mut pairs = StereoPairGraph::new();
    pairs.add_vertex("a", 0).unwrap();
    pairs.add_vertex("b", 1).unwrap();
    pairs.add_vertex("c", 2).unwrap();
    pairs.connect("a", "b", 0.9).unwrap();
    pairs.connect("b", "c", 0.85).unwrap();
    pairs.connect("a", "c", 0.04).unwrap();
    (scene, pairs)
}

fn center_ids<F: DisparityFusion>(mvs: &MultiViewStereo<F>) -> Vec<String> {
    mvs.list_centers().map(|center| center.id.clone()).collect()
}

#[test]
fn abc_scenario_selects_all_three_with_b_first() {
    let _ = pretty_env_logger::try_init();
    let (scene, pairs) = abc_scene();
    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    // Two qualifying neighbors beat one, and 0.9 coverage beats 0.85.
    assert_eq!(center_ids(&mvs), vec!["b", "a", "c"]);
    assert_eq!(mvs.cloud().ranges(), &[0, 3, 6, 9]);
    assert_eq!(mvs.cloud().len(), 9);

    // The quality 0.04 edge between a and c never reaches fusion.
    let calls = calls.borrow();
    assert_eq!(calls.as_slice(), &[
        (1, vec![0, 2]),
        (0, vec![1]),
        (2, vec![1]),
    ]);
}

#[test]
fn edges_below_the_quality_floor_are_never_used() {
    let mut scene = SceneStructure::new();
    scene.add_view(view(-0.2, 0.0));
    scene.add_view(view(0.2, 0.2));
    let mut pairs = StereoPairGraph::new();
    pairs.add_vertex("a", 0).unwrap();
    pairs.add_vertex("b", 1).unwrap();
    // The only edge available is still disqualified.
    pairs.connect("a", "b", 0.04).unwrap();

    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    assert!(calls.borrow().is_empty());
    assert_eq!(center_ids(&mvs), Vec::<String>::new());
    assert!(mvs.cloud().is_empty());
    assert_eq!(mvs.cloud().ranges(), &[0]);
    // Both views scored, both at the bottom of the scale.
    assert_eq!(mvs.ranked_views().len(), 2);
    assert!(mvs.ranked_views().iter().all(|info| info.score == 0.0));
}

#[test]
fn fan_in_is_capped_to_the_best_neighbors() {
    let mut scene = SceneStructure::new();
    scene.add_view(view(0.0, 0.0));
    let yaws = [-1.0, -0.5, 0.5, 1.0, 1.4, 2.2];
    for (index, yaw) in yaws.iter().enumerate() {
        scene.add_view(view(*yaw, 0.2 + 0.1 * index as f64));
    }
    let mut pairs = StereoPairGraph::new();
    pairs.add_vertex("m", 0).unwrap();
    let qualities = [0.9, 0.8, 0.7, 0.6, 0.55, 0.01];
    for (index, quality) in qualities.iter().enumerate() {
        let id = format!("n{}", index);
        pairs.add_vertex(id.clone(), index + 1).unwrap();
        pairs.connect("m", &id, *quality).unwrap();
    }

    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls)).settings(MvsSettings {
        max_combine_pairs: 3,
        ..Default::default()
    });
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    let calls = calls.borrow();
    // The hub has the most coverage and goes first, fusing exactly the
    // three highest quality neighbors.
    assert_eq!(calls[0], (0, vec![1, 2, 3]));
    // The disqualified neighbor never appears anywhere.
    assert!(calls.iter().all(|(_, neighbors)| !neighbors.contains(&6)));
}

#[test]
fn identical_views_prune_exactly_one_of_the_pair() {
    let mut scene = SceneStructure::new();
    scene.add_view(view(0.0, 0.0));
    scene.add_view(view(0.0, 0.0));
    let mut pairs = StereoPairGraph::new();
    pairs.add_vertex("a", 0).unwrap();
    pairs.add_vertex("b", 1).unwrap();
    pairs.connect("a", "b", 0.9).unwrap();

    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    // Equal scores and total overlap: the tie-break excludes "a" and
    // leaves "b" to fuse with "a" as its neighbor.
    assert_eq!(center_ids(&mvs), vec!["b"]);
    assert_eq!(calls.borrow().as_slice(), &[(1, vec![0])]);
    assert!(mvs.ranked_views().iter().all(|info| info.used));
}

#[test]
fn fusion_failure_of_the_top_candidate_skips_only_that_candidate() {
    let (scene, pairs) = abc_scene();
    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::failing_for(&calls, [1]));
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    // "b" fails to fuse but stays available as a neighbor for the others.
    assert_eq!(center_ids(&mvs), vec!["a", "c"]);
    assert_eq!(mvs.cloud().ranges(), &[0, 3, 6]);
    let calls = calls.borrow();
    assert_eq!(calls.as_slice(), &[
        (1, vec![0, 2]),
        (0, vec![1]),
        (2, vec![1]),
    ]);
}

#[test]
fn reruns_are_deterministic_and_reset_state() {
    let (scene, pairs) = abc_scene();
    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));

    mvs.process(&scene, &FlatImages, &pairs).unwrap();
    let first_centers = center_ids(&mvs);
    let first_ranges = mvs.cloud().ranges().to_vec();

    mvs.process(&scene, &FlatImages, &pairs).unwrap();
    assert_eq!(center_ids(&mvs), first_centers);
    assert_eq!(mvs.cloud().ranges(), first_ranges.as_slice());
    // The second run repeated the exact same fusion requests.
    let calls = calls.borrow();
    let (first, second) = calls.split_at(calls.len() / 2);
    assert_eq!(first, second);
}

#[test]
fn duplicate_surfaces_make_an_empty_but_accepted_range() {
    let mut scene = SceneStructure::new();
    scene.add_view(view(0.0, 0.0));
    // Two graph views backed by the same scene view produce identical
    // points, so the second accepted center adds nothing new.
    let mut pairs = StereoPairGraph::new();
    pairs.add_vertex("a", 0).unwrap();
    pairs.add_vertex("b", 0).unwrap();
    pairs.connect("a", "b", 0.9).unwrap();

    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls)).settings(MvsSettings {
        // Disable redundancy pruning so both views become centers.
        maximum_center_overlap: 2.0,
        ..Default::default()
    });
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    assert_eq!(center_ids(&mvs), vec!["a", "b"]);
    assert_eq!(mvs.cloud().ranges(), &[0, 3, 3]);
}

#[test]
fn corrupted_quality_is_caught_during_scoring() {
    let (scene, mut pairs) = abc_scene();
    let edge = pairs.vertex(pairs.vertex_index("a").unwrap()).pairs[0];
    pairs.edge_mut(edge).quality_3d = 1.5;

    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));
    let result = mvs.process(&scene, &FlatImages, &pairs);
    assert!(matches!(result, Err(MvsError::QualityOutOfRange { quality, .. }) if quality == 1.5));
    assert!(calls.borrow().is_empty());
}

struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl MvsListener for Recorder {
    fn pair_disparity(
        &mut self,
        left: &str,
        right: &str,
        _rectified_left: &GrayImage,
        _rectified_right: &GrayImage,
        _disparity: &DisparityImage,
        _parameters: &DisparityParameters,
    ) {
        self.events.borrow_mut().push(format!("pair {} {}", left, right));
    }

    fn fused_disparity(&mut self, center: &str, _disparity: &DisparityImage, _parameters: &DisparityParameters) {
        self.events.borrow_mut().push(format!("fused {}", center));
    }
}

#[test]
fn listener_observes_pairwise_and_fused_results() {
    let (scene, pairs) = abc_scene();
    let calls: Calls = Default::default();
    let events = Rc::new(RefCell::new(vec![]));
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls)).listener(Recorder {
        events: Rc::clone(&events),
    });
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    assert_eq!(
        events.borrow().as_slice(),
        &[
            "pair b a".to_string(),
            "pair b c".to_string(),
            "fused b".to_string(),
            "pair a b".to_string(),
            "fused a".to_string(),
            "pair c b".to_string(),
            "fused c".to_string(),
        ]
    );
}

#[test]
fn colorize_samples_every_roundtrip_visible_point() {
    let (scene, pairs) = abc_scene();
    let calls: Calls = Default::default();
    let mut mvs = MultiViewStereo::new(RecordingFusion::new(&calls));
    mvs.process(&scene, &FlatImages, &pairs).unwrap();

    let mut seen = vec![];
    mvs.colorize(&scene, &FlatImages, |index, rgb| seen.push((index, rgb))).unwrap();
    // Every point projects back into the view it came from.
    assert_eq!(seen.len(), mvs.cloud().len());
    let mut indices: Vec<usize> = seen.iter().map(|&(index, _)| index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..mvs.cloud().len()).collect::<Vec<_>>());
    assert!(seen.iter().all(|&(_, rgb)| rgb == [9, 9, 9]));
}
