pub mod annotate;
pub mod automatic;
pub mod config;
pub mod errors;
pub mod image_state;
pub mod imageops_ai;
pub mod inference;
pub mod model;
pub mod point;
pub mod preprocess;
pub mod server;
pub mod session;
pub mod traits;

pub mod mocks;

pub use config::Config;
pub use errors::{Result, SamDemoError};
pub use image_state::{ColorOrder, ExampleId, ExampleRegistry, ImageSource, ImageState, TaggedImage};
pub use inference::{InferenceSettings, SamParameters, SegmentationOutput, SegmentationRequest};
pub use model::{Device, SamModel, SamModelKind};
pub use point::{Point, PointLabel, PointStore};
pub use server::{router, AppState};
pub use session::{Session, SessionId, SessionStore, Snapshot};
pub use traits::*;
