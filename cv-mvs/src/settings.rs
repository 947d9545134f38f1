#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for a multi-view stereo run.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone)]
pub struct MvsSettings {
    /// The minimum quality of the 3D information between two views for the pair to be
    /// used in scoring or fusion
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_minimum_quality_3d")
    )]
    pub minimum_quality_3d: f64,
    /// The fraction of a view's rectified footprint that a better ranked neighbor may
    /// cover before the view is excluded as a redundant center
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_maximum_center_overlap")
    )]
    pub maximum_center_overlap: f64,
    /// The maximum number of stereo pairs combined into one fused disparity. If more
    /// pairs qualify then the best are selected.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_combine_pairs")
    )]
    pub max_combine_pairs: usize,
    /// The world-unit radius below which a candidate cloud point is a duplicate of an
    /// existing point
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_duplicate_tolerance")
    )]
    pub duplicate_tolerance: f64,
    /// The number of cells along the longer axis of the coverage scoring grid
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_coverage_grid_side")
    )]
    pub coverage_grid_side: usize,
}

impl Default for MvsSettings {
    fn default() -> Self {
        Self {
            minimum_quality_3d: default_minimum_quality_3d(),
            maximum_center_overlap: default_maximum_center_overlap(),
            max_combine_pairs: default_max_combine_pairs(),
            duplicate_tolerance: default_duplicate_tolerance(),
            coverage_grid_side: default_coverage_grid_side(),
        }
    }
}

fn default_minimum_quality_3d() -> f64 {
    0.05
}

fn default_maximum_center_overlap() -> f64 {
    0.80
}

fn default_max_combine_pairs() -> usize {
    10
}

fn default_duplicate_tolerance() -> f64 {
    0.001
}

fn default_coverage_grid_side() -> usize {
    50
}
