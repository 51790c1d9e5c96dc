//! Model catalog and resource types shared by every sift crate.

mod catalog;
mod resource;

pub use catalog::{
    default_model, is_allowed_embedding_model, Artifact, Catalog, CompanionArtifact,
    ModelDescriptor, ALLOWED_EMBEDDING_MODELS, DEFAULT_EMBEDDING_MODEL, DEFAULT_TEXT_MODEL,
    DEFAULT_VISION_MODEL,
};
pub use resource::{classify_filename, ResourceType};

/// Extension of every loadable model file.
pub const MODEL_EXTENSION: &str = "gguf";

/// Suffix appended to in-progress downloads.
pub const PARTIAL_SUFFIX: &str = ".partial";
