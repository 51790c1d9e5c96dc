use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three independently managed model slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Text,
    Vision,
    Embedding,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [Self::Text, Self::Vision, Self::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Vision => "vision",
            Self::Embedding => "embedding",
        }
    }

    /// Dense index, used for fixed-size per-type tables.
    pub fn index(&self) -> usize {
        match self {
            Self::Text => 0,
            Self::Vision => 1,
            Self::Embedding => 2,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filename tokens that mark an embedding model.
const EMBEDDING_TOKENS: &[&str] = &["embed", "nomic-embed"];

/// Filename tokens that mark a vision model.
const VISION_TOKENS: &[&str] = &["vision", "llava", "bakllava"];

/// Guess the resource type of a model file from its name.
///
/// Used for files found on disk that are not in the catalog.
pub fn classify_filename(filename: &str) -> ResourceType {
    let lower = filename.to_lowercase();
    if EMBEDDING_TOKENS.iter().any(|t| lower.contains(t)) {
        ResourceType::Embedding
    } else if VISION_TOKENS.iter().any(|t| lower.contains(t)) {
        ResourceType::Vision
    } else {
        ResourceType::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_embedding() {
        assert_eq!(
            classify_filename("nomic-embed-text-v1.5.Q8_0.gguf"),
            ResourceType::Embedding
        );
        assert_eq!(
            classify_filename("mxbai-EMBED-large.gguf"),
            ResourceType::Embedding
        );
    }

    #[test]
    fn test_classify_vision() {
        assert_eq!(
            classify_filename("llava-v1.6-mistral-7b.Q4_K_M.gguf"),
            ResourceType::Vision
        );
        assert_eq!(
            classify_filename("BakLLaVA-1-Q4_K_M.gguf"),
            ResourceType::Vision
        );
        assert_eq!(
            classify_filename("some-vision-model.gguf"),
            ResourceType::Vision
        );
    }

    #[test]
    fn test_classify_defaults_to_text() {
        assert_eq!(
            classify_filename("Llama-3.2-3B-Instruct-Q4_K_M.gguf"),
            ResourceType::Text
        );
    }

    #[test]
    fn test_index_is_dense() {
        let indices: Vec<usize> = ResourceType::ALL.iter().map(|t| t.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&ResourceType::Embedding).unwrap();
        assert_eq!(json, "\"embedding\"");
        let back: ResourceType = serde_json::from_str("\"vision\"").unwrap();
        assert_eq!(back, ResourceType::Vision);
    }
}
