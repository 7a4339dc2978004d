mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_CHAT, CAPABILITY_DETECT};
pub use selectors::{ModelSelection, ModelSelector};
