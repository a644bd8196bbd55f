//! Process-wide table of live stages.
//!
//! A stage is registered from `create` until `destroy`. Lookups by name let
//! a stage resolve its downstream neighbor during setup; lookups by id
//! validate a handle before every stage operation.

use crate::engine::{PipelineStage, StageControl};
use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

/// Process-unique identity of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StageId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    id: StageId,
    control: Arc<dyn StageControl>,
    typed: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Registry {
    by_name: HashMap<String, Entry>,
    by_id: HashMap<StageId, String>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

pub(crate) fn register<S: Stage>(stage: Arc<PipelineStage<S>>) -> Result<()> {
    let mut registry = REGISTRY.write();
    let name = stage.name().to_string();
    if registry.by_name.contains_key(&name) {
        return Err(PipelineError::AlreadyExists(name));
    }
    let id = stage.id();
    registry.by_id.insert(id, name.clone());
    registry.by_name.insert(
        name,
        Entry {
            id,
            control: stage.clone(),
            typed: stage,
        },
    );
    Ok(())
}

pub(crate) fn unregister(id: StageId) -> bool {
    let mut registry = REGISTRY.write();
    match registry.by_id.remove(&id) {
        Some(name) => {
            registry.by_name.remove(&name);
            true
        }
        None => false,
    }
}

/// Whether the stage with this id is still registered
pub fn contains(id: StageId) -> bool {
    REGISTRY.read().by_id.contains_key(&id)
}

/// Look up a stage by name with its concrete hook type
pub fn find<S: Stage>(name: &str) -> Result<Arc<PipelineStage<S>>> {
    let registry = REGISTRY.read();
    let entry = registry
        .by_name
        .get(name)
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
    Arc::clone(&entry.typed)
        .downcast::<PipelineStage<S>>()
        .map_err(|_| PipelineError::InvalidObject)
}

/// Look up a stage by name through its type-erased lifecycle surface
pub fn find_control(name: &str) -> Result<Arc<dyn StageControl>> {
    REGISTRY
        .read()
        .by_name
        .get(name)
        .map(|entry| Arc::clone(&entry.control))
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))
}

/// Id of the stage registered under `name`
pub fn id_of(name: &str) -> Option<StageId> {
    REGISTRY.read().by_name.get(name).map(|entry| entry.id)
}

/// Names of all registered stages, sorted
pub fn names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().by_name.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = StageId::next();
        let b = StageId::next();
        assert_ne!(a, b);
        assert!(!contains(a));
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(
            find_control("registry-test-missing"),
            Err(PipelineError::NotFound(_))
        ));
        assert!(id_of("registry-test-missing").is_none());
        assert!(!unregister(StageId::next()));
    }
}
