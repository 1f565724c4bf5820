//! Stacks sequences of near-duplicate frames into a single cleaner image:
//! pairwise offset search, global alignment, and a weighted merge.

pub mod alignment;
pub mod cache;
pub mod comparator;
pub mod config;
pub mod container;
pub mod difference;
pub mod geometry;
pub mod gradient;
pub mod image_ex;
pub mod image_io;
pub mod plane;
pub mod progress;
pub mod settings;
pub mod stacking;

pub use alignment::Aligner;
pub use comparator::{AlignMethod, Comparator, ImageOffset};
pub use config::ProcessingConfig;
pub use container::Container;
pub use image_ex::{ColorSystem, ImageEx};
pub use plane::Plane;
pub use progress::{Progress, ProgressCallback};
pub use stacking::{MergeMode, MergeRenderer};
