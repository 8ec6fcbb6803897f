pub mod capture;
pub mod cli;
pub mod config;
pub mod db;
pub mod extractor;
pub mod frame;
pub mod geometry;
pub mod matcher;
mod metrics;
pub mod preprocess;
mod server;
pub mod utils;

pub use capture::{CaptureHandle, CaptureLoop};
pub use config::Opts;
pub use db::{Catalog, CatalogBuilder, CatalogItem, CatalogStore};
pub use extractor::{FeatureExtractor, Fingerprint, ThumbnailExtractor};
pub use frame::{DirectorySource, Frame, FrameSource};
pub use matcher::{MatchParams, MatchResult, Matcher};
pub use preprocess::{PreprocessMode, Preprocessor};
