//! Supported model list.
//!
//! Seeded from config (or a built-in fallback) and refreshed from the Gemini
//! `models.list` endpoint by a background task. Lookups never hit the network.

use std::sync::{PoisonError, RwLock};
use tracing::info;

use crate::relay::gateway::{GatewayError, ModelGateway};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Model known only by id; the id doubles as display name.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }
}

/// Used when nothing is configured and discovery has not succeeded yet.
pub fn fallback_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
        ModelInfo::new("gemini-1.5-pro", "Gemini 1.5 Pro"),
        ModelInfo::new("gemini-1.5-flash", "Gemini 1.5 Flash"),
    ]
}

pub struct ModelCatalog {
    default_model: String,
    models: RwLock<Vec<ModelInfo>>,
}

impl ModelCatalog {
    /// The default model is always part of the catalog.
    pub fn new(models: Vec<ModelInfo>, default_model: &str) -> Self {
        Self {
            default_model: default_model.to_string(),
            models: RwLock::new(normalize(models, default_model)),
        }
    }

    /// Models sorted by id.
    pub fn snapshot(&self) -> Vec<ModelInfo> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.id == id)
    }

    /// Display name for `id`, or the id itself if unknown.
    pub fn display_name(&self, id: &str) -> String {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Replace the list with what the backend reports. On error (or an empty
    /// listing) the current list stays in place.
    pub async fn refresh(&self, gateway: &dyn ModelGateway) -> Result<usize, GatewayError> {
        let discovered = gateway.list_models().await?;
        if discovered.is_empty() {
            return Err(GatewayError::Empty);
        }

        let models = normalize(discovered, &self.default_model);
        let count = models.len();
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = models;
        info!("📋 Model catalog refreshed ({} models)", count);
        Ok(count)
    }
}

fn normalize(mut models: Vec<ModelInfo>, default_model: &str) -> Vec<ModelInfo> {
    if !models.iter().any(|m| m.id == default_model) {
        models.push(ModelInfo::from_id(default_model));
    }
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup_by(|a, b| a.id == b.id);
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::gateway::testing::FakeGateway;

    #[test]
    fn test_fallback_contains_default() {
        let catalog = ModelCatalog::new(fallback_models(), "gemini-2.0-flash");
        assert_eq!(catalog.len(), 3);
        assert!(catalog.contains("gemini-1.5-pro"));
        assert_eq!(catalog.display_name("gemini-2.0-flash"), "Gemini 2.0 Flash");
    }

    #[test]
    fn test_default_model_always_present() {
        let catalog = ModelCatalog::new(vec![ModelInfo::from_id("gemini-1.5-pro")], "gemini-exp-1206");
        assert!(catalog.contains("gemini-exp-1206"));
        assert_eq!(catalog.display_name("gemini-exp-1206"), "gemini-exp-1206");
    }

    #[test]
    fn test_snapshot_sorted_and_deduplicated() {
        let catalog = ModelCatalog::new(
            vec![
                ModelInfo::from_id("b"),
                ModelInfo::from_id("a"),
                ModelInfo::from_id("b"),
            ],
            "a",
        );
        let ids: Vec<_> = catalog.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_display_name_is_id() {
        let catalog = ModelCatalog::new(fallback_models(), "gemini-2.0-flash");
        assert_eq!(catalog.display_name("mystery"), "mystery");
        assert!(!catalog.contains("mystery"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_models() {
        let catalog = ModelCatalog::new(fallback_models(), "gemini-2.0-flash");
        let gateway = FakeGateway::new().with_models(vec![
            ModelInfo::new("gemini-2.5-pro", "Gemini 2.5 Pro"),
            ModelInfo::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
        ]);

        let count = catalog.refresh(&gateway).await.unwrap();

        assert_eq!(count, 2);
        assert!(catalog.contains("gemini-2.5-pro"));
        assert!(!catalog.contains("gemini-1.5-pro"));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_models() {
        let catalog = ModelCatalog::new(fallback_models(), "gemini-2.0-flash");
        let gateway = FakeGateway::new();

        assert!(catalog.refresh(&gateway).await.is_err());
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_empty_listing_keeps_models() {
        let catalog = ModelCatalog::new(fallback_models(), "gemini-2.0-flash");
        let gateway = FakeGateway::new().with_models(vec![]);

        assert!(matches!(catalog.refresh(&gateway).await, Err(GatewayError::Empty)));
        assert!(catalog.contains("gemini-1.5-flash"));
    }
}
