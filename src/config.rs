use serde::{Deserialize, Serialize};

use crate::alignment::Aligner;
use crate::comparator::{AlignMethod, Comparator, GradientSettings};
use crate::difference::{self, DiffSettings};
use crate::stacking::{MergeMode, MergeRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparatorKind {
    BruteForce,
    Gradient,
    MultiScale,
    LogPolar,
}

impl std::fmt::Display for ComparatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparatorKind::BruteForce => write!(f, "Brute force (Exhaustive)"),
            ComparatorKind::Gradient => write!(f, "Gradient (Recommended)"),
            ComparatorKind::MultiScale => write!(f, "Multi-scale (Fast)"),
            ComparatorKind::LogPolar => write!(f, "Log-polar (Unimplemented)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignerKind {
    Average,
    Recursive,
    Cluster,
    Independent,
    Linear,
    FrameCalculator,
    SuperRes,
}

impl std::fmt::Display for AlignerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlignerKind::Average => write!(f, "Average chain"),
            AlignerKind::Recursive => write!(f, "Recursive (Recommended)"),
            AlignerKind::Cluster => write!(f, "Cluster frames"),
            AlignerKind::Independent => write!(f, "Independent neighbors"),
            AlignerKind::Linear => write!(f, "Linear drift fit"),
            AlignerKind::FrameCalculator => write!(f, "Frame calculator"),
            AlignerKind::SuperRes => write!(f, "Super resolution"),
        }
    }
}

/// Everything configurable about one stacking run. Persisted as-is by the
/// settings module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub comparator: ComparatorKind,
    pub aligner: AlignerKind,
    pub method: AlignMethod,
    /// Search range as a fraction of image size.
    pub movement: f64,
    pub start_level: i32,
    pub max_level: i32,
    /// Metric sampling stride; 1 samples every pixel.
    pub stride: usize,
    pub use_l2: bool,
    /// Noise floor for the difference metric, in raw sample units.
    pub epsilon: u16,
    /// Retry threshold for the recursive search, as a fraction of white.
    pub max_difference: f64,
    // Aligner knobs
    pub use_average: bool,
    pub min_groups: usize,
    pub max_groups: usize,
    pub neighbor_range: usize,
    pub frame_offset: i64,
    pub frame_amount: i64,
    pub frame_repeats: i64,
    pub super_res_scale: f64,
    pub super_res_iterations: usize,
    // Render knobs
    pub merge_mode: MergeMode,
    pub upscale_chroma: bool,
    pub max_render_count: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            comparator: ComparatorKind::Gradient,
            aligner: AlignerKind::Average,
            method: AlignMethod::Both,
            movement: 0.75,
            start_level: 1,
            max_level: 6,
            stride: 1,
            use_l2: false,
            epsilon: 0,
            max_difference: 0.10,
            use_average: true,
            min_groups: 1,
            max_groups: 20,
            neighbor_range: 3,
            frame_offset: 0,
            frame_amount: 1,
            frame_repeats: 1,
            super_res_scale: 2.0,
            super_res_iterations: 2,
            merge_mode: MergeMode::Average,
            upscale_chroma: true,
            max_render_count: None,
        }
    }
}

impl ProcessingConfig {
    pub fn diff_settings(&self) -> DiffSettings {
        DiffSettings { stride: self.stride.max(1), use_l2: self.use_l2, epsilon: self.epsilon }
    }

    pub fn build_comparator(&self) -> Comparator {
        match self.comparator {
            ComparatorKind::BruteForce => Comparator::BruteForce {
                method: self.method,
                movement: self.movement,
                settings: self.diff_settings(),
            },
            ComparatorKind::Gradient => Comparator::Gradient(GradientSettings {
                method: self.method,
                movement: self.movement,
                start_level: self.start_level,
                max_level: self.max_level,
                settings: self.diff_settings(),
                max_difference: difference::error_level(self.max_difference),
            }),
            ComparatorKind::MultiScale => {
                Comparator::MultiScale { settings: self.diff_settings() }
            }
            ComparatorKind::LogPolar => Comparator::LogPolar,
        }
    }

    pub fn build_aligner(&self) -> Aligner {
        match self.aligner {
            AlignerKind::Average => Aligner::Average { use_average: self.use_average },
            AlignerKind::Recursive => Aligner::Recursive,
            AlignerKind::Cluster => Aligner::Cluster {
                min_groups: self.min_groups,
                max_groups: self.max_groups,
            },
            AlignerKind::Independent => Aligner::Independent { range: self.neighbor_range },
            AlignerKind::Linear => Aligner::Linear { method: self.method },
            AlignerKind::FrameCalculator => Aligner::FrameCalculator {
                offset: self.frame_offset,
                amount: self.frame_amount,
                repeats: self.frame_repeats,
            },
            AlignerKind::SuperRes => Aligner::SuperRes {
                scale: self.super_res_scale,
                iterations: self.super_res_iterations,
            },
        }
    }

    pub fn build_renderer(&self) -> MergeRenderer {
        MergeRenderer { mode: self.merge_mode, upscale_chroma: self.upscale_chroma }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_json() {
        let config = ProcessingConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: ProcessingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.comparator, config.comparator);
        assert_eq!(back.merge_mode, config.merge_mode);
        assert_eq!(back.movement, config.movement);
    }

    #[test]
    fn test_builders_follow_selection() {
        let mut config = ProcessingConfig::default();
        config.comparator = ComparatorKind::MultiScale;
        config.aligner = AlignerKind::Independent;
        config.neighbor_range = 5;

        assert!(matches!(config.build_comparator(), Comparator::MultiScale { .. }));
        assert!(matches!(config.build_aligner(), Aligner::Independent { range: 5 }));
    }
}
