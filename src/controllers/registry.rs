use std::collections::BTreeMap;

use crate::resources::entity::Entity;

/// Last successfully applied entity per name.
///
/// Not synchronized, the owning engine serializes access.
#[derive(Debug, Clone)]
pub struct RunningStateRegistry<E> {
    entities: BTreeMap<String, E>,
}

impl<E> Default for RunningStateRegistry<E> {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }
}

impl<E: Entity> RunningStateRegistry<E> {
    /// Inserts or replaces the entry with the entity's name
    pub fn put(&mut self, entity: E) {
        self.entities.insert(entity.name().to_string(), entity);
    }

    pub fn delete(&mut self, name: &str) -> Option<E> {
        self.entities.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&E> {
        self.entities.get(name)
    }

    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Drops every entry whose name is not kept
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entities.retain(|name, _| keep(name));
    }
}
