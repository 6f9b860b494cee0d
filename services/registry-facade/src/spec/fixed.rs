use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use regfac_api::ImageSpec;
use tracing::info;

use super::{ImageSpecProvider, SpecError};

/// Specs from a JSON file mapping ref to spec.
#[derive(Debug, Default)]
pub struct FixedSpecProvider {
    specs: HashMap<String, ImageSpec>,
}

impl FixedSpecProvider {
    pub fn new(specs: HashMap<String, ImageSpec>) -> Self {
        Self { specs }
    }

    pub async fn load(path: &Path) -> Result<Self, SpecError> {
        let data = tokio::fs::read(path).await.map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let specs: HashMap<String, ImageSpec> = serde_json::from_slice(&data)?;
        info!(path = %path.display(), specs = specs.len(), "loaded fixed image specs");
        Ok(Self::new(specs))
    }
}

#[async_trait]
impl ImageSpecProvider for FixedSpecProvider {
    async fn get_spec(&self, reference: &str) -> Result<ImageSpec, SpecError> {
        self.specs
            .get(reference)
            .cloned()
            .ok_or_else(|| SpecError::InvalidRef(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.json");
        std::fs::write(
            &path,
            r#"{"ws-1": {"baseRef": "alpine:3.20", "ideRef": "ide:1"}}"#,
        )
        .unwrap();

        let provider = FixedSpecProvider::load(&path).await.unwrap();
        let spec = provider.get_spec("ws-1").await.unwrap();
        assert_eq!(spec.base_ref, "alpine:3.20");
        assert_eq!(spec.ide_ref.as_deref(), Some("ide:1"));

        let err = provider.get_spec("ws-2").await.unwrap_err();
        assert!(err.is_invalid_ref());
    }

    #[tokio::test]
    async fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("specs.json");
        std::fs::write(&path, "[]").unwrap();

        assert!(matches!(
            FixedSpecProvider::load(&path).await,
            Err(SpecError::Json(_))
        ));
        assert!(matches!(
            FixedSpecProvider::load(&dir.path().join("missing.json")).await,
            Err(SpecError::Io { .. })
        ));
    }
}
