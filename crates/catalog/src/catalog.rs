//! Model catalog.
//!
//! Static, versioned data describing every model the application knows how to
//! download. Entries are immutable once the catalog is built.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::ResourceType;

/// Secondary file required next to a primary model (e.g. a vision projector).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanionArtifact {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    /// SHA-256 checksum (lowercase hex), if published.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Catalog entry for a downloadable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    /// Unique id, also the filename on disk.
    pub name: String,
    pub display_name: String,
    pub resource_type: ResourceType,
    pub url: String,
    /// Exact size on disk in bytes.
    pub size_bytes: u64,
    /// SHA-256 checksum (lowercase hex), if published.
    #[serde(default)]
    pub sha256: Option<String>,
    pub quantization: String,
    #[serde(default)]
    pub requires_gpu: bool,
    /// Minimum system RAM in GB recommended for this model.
    #[serde(default)]
    pub min_ram_gb: u32,
    #[serde(default)]
    pub companion: Option<CompanionArtifact>,
}

/// A single downloadable file, either a primary model or a companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub url: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub resource_type: ResourceType,
    /// Name of the primary model this file belongs to. Equal to `filename`
    /// for primary artifacts.
    pub owner: String,
    /// Companion declared by the primary. Always `None` for companions.
    pub companion: Option<CompanionArtifact>,
}

impl Artifact {
    pub fn is_companion(&self) -> bool {
        self.owner != self.filename
    }
}

impl ModelDescriptor {
    fn artifact(&self) -> Artifact {
        Artifact {
            filename: self.name.clone(),
            url: self.url.clone(),
            size_bytes: self.size_bytes,
            sha256: self.sha256.clone(),
            resource_type: self.resource_type,
            owner: self.name.clone(),
            companion: self.companion.clone(),
        }
    }
}

/// Lookup table over model descriptors.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<ModelDescriptor>,
    by_name: HashMap<String, usize>,
    companions: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(entries: Vec<ModelDescriptor>) -> Self {
        let mut by_name = HashMap::new();
        let mut companions = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_name.insert(entry.name.clone(), idx);
            if let Some(companion) = &entry.companion {
                companions.insert(companion.filename.clone(), idx);
            }
        }
        Self {
            entries,
            by_name,
            companions,
        }
    }

    /// The catalog compiled into the application.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    pub fn entries(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Resolve a filename to a downloadable artifact.
    ///
    /// Companion files are addressable by their own filename.
    pub fn resolve(&self, filename: &str) -> Option<Artifact> {
        if let Some(entry) = self.get(filename) {
            return Some(entry.artifact());
        }

        let owner = &self.entries[*self.companions.get(filename)?];
        let companion = owner.companion.as_ref()?;
        Some(Artifact {
            filename: companion.filename.clone(),
            url: companion.url.clone(),
            size_bytes: companion.size_bytes,
            sha256: companion.sha256.clone(),
            resource_type: owner.resource_type,
            owner: owner.name.clone(),
            companion: None,
        })
    }

    pub fn models_of(&self, resource_type: ResourceType) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries
            .iter()
            .filter(move |e| e.resource_type == resource_type)
    }
}

/// Default text generation model.
pub const DEFAULT_TEXT_MODEL: &str = "Llama-3.2-3B-Instruct-Q4_K_M.gguf";

/// Default vision model.
pub const DEFAULT_VISION_MODEL: &str = "llava-v1.6-mistral-7b.Q4_K_M.gguf";

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text-v1.5.Q8_0.gguf";

/// Embedding models accepted in configuration. Anything else is replaced by
/// [`DEFAULT_EMBEDDING_MODEL`], since stored vectors depend on the model.
pub const ALLOWED_EMBEDDING_MODELS: &[&str] = &[
    "nomic-embed-text-v1.5.Q8_0.gguf",
    "nomic-embed-text-v1.5.f16.gguf",
];

pub fn default_model(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Text => DEFAULT_TEXT_MODEL,
        ResourceType::Vision => DEFAULT_VISION_MODEL,
        ResourceType::Embedding => DEFAULT_EMBEDDING_MODEL,
    }
}

pub fn is_allowed_embedding_model(name: &str) -> bool {
    ALLOWED_EMBEDDING_MODELS.contains(&name)
}

fn hf_url(repo: &str, file: &str) -> String {
    format!("https://huggingface.co/{repo}/resolve/main/{file}")
}

// Sizes are exact byte counts from the upstream file listings; downloads and
// presence checks compare them exactly.
static BUILTIN: LazyLock<Catalog> = LazyLock::new(|| {
    Catalog::new(vec![
        // Text generation
        ModelDescriptor {
            name: DEFAULT_TEXT_MODEL.to_string(),
            display_name: "Llama 3.2 3B Instruct".to_string(),
            resource_type: ResourceType::Text,
            url: hf_url("bartowski/Llama-3.2-3B-Instruct-GGUF", DEFAULT_TEXT_MODEL),
            size_bytes: 2_019_377_696,
            sha256: None,
            quantization: "Q4_K_M".to_string(),
            requires_gpu: false,
            min_ram_gb: 4,
            companion: None,
        },
        ModelDescriptor {
            name: "Qwen2.5-7B-Instruct-Q4_K_M.gguf".to_string(),
            display_name: "Qwen 2.5 7B Instruct".to_string(),
            resource_type: ResourceType::Text,
            url: hf_url(
                "bartowski/Qwen2.5-7B-Instruct-GGUF",
                "Qwen2.5-7B-Instruct-Q4_K_M.gguf",
            ),
            size_bytes: 4_683_073_952,
            sha256: None,
            quantization: "Q4_K_M".to_string(),
            requires_gpu: false,
            min_ram_gb: 8,
            companion: None,
        },
        // Vision (needs the CLIP projector next to it)
        ModelDescriptor {
            name: DEFAULT_VISION_MODEL.to_string(),
            display_name: "LLaVA 1.6 Mistral 7B".to_string(),
            resource_type: ResourceType::Vision,
            url: hf_url("cjpais/llava-v1.6-mistral-7b-gguf", DEFAULT_VISION_MODEL),
            size_bytes: 4_368_439_584,
            sha256: None,
            quantization: "Q4_K_M".to_string(),
            requires_gpu: false,
            min_ram_gb: 8,
            companion: Some(CompanionArtifact {
                filename: "mmproj-model-f16.gguf".to_string(),
                url: hf_url("cjpais/llava-v1.6-mistral-7b-gguf", "mmproj-model-f16.gguf"),
                size_bytes: 624_434_336,
                sha256: None,
            }),
        },
        // Embeddings
        ModelDescriptor {
            name: DEFAULT_EMBEDDING_MODEL.to_string(),
            display_name: "Nomic Embed Text v1.5 (Q8_0)".to_string(),
            resource_type: ResourceType::Embedding,
            url: hf_url("nomic-ai/nomic-embed-text-v1.5-GGUF", DEFAULT_EMBEDDING_MODEL),
            size_bytes: 146_146_432,
            sha256: None,
            quantization: "Q8_0".to_string(),
            requires_gpu: false,
            min_ram_gb: 2,
            companion: None,
        },
        ModelDescriptor {
            name: "nomic-embed-text-v1.5.f16.gguf".to_string(),
            display_name: "Nomic Embed Text v1.5 (F16)".to_string(),
            resource_type: ResourceType::Embedding,
            url: hf_url(
                "nomic-ai/nomic-embed-text-v1.5-GGUF",
                "nomic-embed-text-v1.5.f16.gguf",
            ),
            size_bytes: 274_290_560,
            sha256: None,
            quantization: "F16".to_string(),
            requires_gpu: false,
            min_ram_gb: 2,
            companion: None,
        },
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    fn vision_entry() -> ModelDescriptor {
        ModelDescriptor {
            name: "llava-test.gguf".to_string(),
            display_name: "LLaVA test".to_string(),
            resource_type: ResourceType::Vision,
            url: "http://localhost/llava-test.gguf".to_string(),
            size_bytes: 100,
            sha256: Some("abc".to_string()),
            quantization: "Q4_K_M".to_string(),
            requires_gpu: false,
            min_ram_gb: 0,
            companion: Some(CompanionArtifact {
                filename: "mmproj-test.gguf".to_string(),
                url: "http://localhost/mmproj-test.gguf".to_string(),
                size_bytes: 10,
                sha256: None,
            }),
        }
    }

    #[test]
    fn test_resolve_primary() {
        let catalog = Catalog::new(vec![vision_entry()]);
        let artifact = catalog.resolve("llava-test.gguf").unwrap();
        assert!(!artifact.is_companion());
        assert_eq!(artifact.size_bytes, 100);
        assert_eq!(artifact.sha256.as_deref(), Some("abc"));
        assert_eq!(
            artifact.companion.as_ref().map(|c| c.filename.as_str()),
            Some("mmproj-test.gguf")
        );
    }

    #[test]
    fn test_resolve_companion_by_own_filename() {
        let catalog = Catalog::new(vec![vision_entry()]);
        let artifact = catalog.resolve("mmproj-test.gguf").unwrap();
        assert!(artifact.is_companion());
        assert_eq!(artifact.owner, "llava-test.gguf");
        assert_eq!(artifact.size_bytes, 10);
        assert_eq!(artifact.resource_type, ResourceType::Vision);
        assert!(artifact.companion.is_none());
    }

    #[test]
    fn test_resolve_unknown() {
        let catalog = Catalog::new(vec![vision_entry()]);
        assert!(catalog.resolve("nope.gguf").is_none());
    }

    #[test]
    fn test_builtin_has_defaults_for_every_type() {
        let catalog = Catalog::builtin();
        for ty in ResourceType::ALL {
            let entry = catalog
                .get(default_model(ty))
                .unwrap_or_else(|| panic!("missing default for {ty}"));
            assert_eq!(entry.resource_type, ty);
        }
    }

    #[test]
    fn test_builtin_embedding_allow_list_is_in_catalog() {
        let catalog = Catalog::builtin();
        for name in ALLOWED_EMBEDDING_MODELS {
            assert!(catalog.contains(name), "{name} not in catalog");
        }
        assert!(is_allowed_embedding_model(DEFAULT_EMBEDDING_MODEL));
        assert!(!is_allowed_embedding_model("random-embed.gguf"));
    }

    #[test]
    fn test_builtin_vision_declares_companion() {
        let catalog = Catalog::builtin();
        let vision = catalog.get(DEFAULT_VISION_MODEL).unwrap();
        let companion = vision.companion.as_ref().unwrap();
        assert!(catalog.resolve(&companion.filename).unwrap().is_companion());
    }

    #[test]
    fn test_builtin_sizes_are_exact_byte_counts() {
        let catalog = Catalog::builtin();
        for entry in catalog.entries() {
            assert!(entry.size_bytes > 0, "{} has no size", entry.name);
            assert_ne!(entry.size_bytes % 1_000_000, 0, "{} size looks rounded", entry.name);
            if let Some(companion) = &entry.companion {
                assert!(companion.size_bytes > 0, "{} has no size", companion.filename);
            }
        }
    }

    #[test]
    fn test_models_of_filters_by_type() {
        let catalog = Catalog::builtin();
        assert!(catalog
            .models_of(ResourceType::Embedding)
            .all(|m| m.resource_type == ResourceType::Embedding));
        assert_eq!(catalog.models_of(ResourceType::Embedding).count(), 2);
    }

    #[test]
    fn test_descriptor_json_is_camel_case() {
        let json = serde_json::to_value(vision_entry()).unwrap();
        assert_eq!(json["resourceType"], "vision");
        assert_eq!(json["sizeBytes"], 100);
        assert_eq!(json["companion"]["filename"], "mmproj-test.gguf");
    }
}
