pub mod chat;
pub mod color;
pub mod data_uri;
pub mod error;
pub mod events;
pub mod geometry;
pub mod models;
pub mod providers;
pub mod receipts;

pub use color::{ColorSpec, ColorSubstitutionRule};
pub use data_uri::EncodedImage;
pub use error::{SifterError, SifterResult};
pub use geometry::{DetectedBox, FrameDims, Rectangle, RegionOutcome};
