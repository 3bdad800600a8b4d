use std::sync::Arc;

use arc_swap::ArcSwap;
use kindle_llm::ModelInfo;

const RECENT_MODEL_LIMIT: usize = 2;

/// Notified whenever a message is actually sent with a model.
pub trait UsageTracker: Send + Sync {
    fn track_model_usage(&self, model_id: &str);
}

/// Tracker that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageTracker;

impl UsageTracker for NoopUsageTracker {
    fn track_model_usage(&self, _model_id: &str) {}
}

/// Last two distinct models used, most recent first.
#[derive(Default)]
pub struct RecentModels {
    catalog: ArcSwap<Vec<ModelInfo>>,
    recent: ArcSwap<Vec<ModelInfo>>,
}

impl RecentModels {
    pub fn new(catalog: Vec<ModelInfo>) -> Self {
        Self {
            catalog: ArcSwap::from_pointee(catalog),
            recent: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces the catalog used to resolve ids. Already tracked models are kept.
    pub fn set_catalog(&self, catalog: Vec<ModelInfo>) {
        self.catalog.store(Arc::new(catalog));
    }

    pub fn recent(&self) -> Vec<ModelInfo> {
        self.recent.load().as_ref().clone()
    }

    /// `(current, previous)` once two distinct models have been used.
    pub fn last_two(&self) -> Option<(ModelInfo, ModelInfo)> {
        let recent = self.recent.load();
        match recent.as_slice() {
            [current, previous, ..] => Some((current.clone(), previous.clone())),
            _ => None,
        }
    }
}

impl UsageTracker for RecentModels {
    fn track_model_usage(&self, model_id: &str) {
        let catalog = self.catalog.load();
        let Some(model) = catalog.iter().find(|model| model.id == model_id) else {
            tracing::debug!(model_id = %model_id, "ignoring usage of model outside the catalog");
            return;
        };

        self.recent.rcu(|recent| {
            let mut updated = Vec::with_capacity(RECENT_MODEL_LIMIT);
            updated.push(model.clone());
            updated.extend(
                recent
                    .iter()
                    .filter(|existing| existing.id != model_id)
                    .cloned(),
            );
            updated.truncate(RECENT_MODEL_LIMIT);
            updated
        });
    }
}
