// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed sync handlers and their type-erased form stored in the registry.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use super::SyncError;

type NameFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
type CurrentFn<T> = Arc<dyn Fn(&str) -> Option<T> + Send + Sync>;
type WriterFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type CollectorFn<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// Reconciles one category of shared configuration.
///
/// Items are converted with serde. An incoming item is written when the sync
/// is forced, when the handler always forces, or when it differs from the
/// current local item of the same name. Writers must be idempotent.
pub struct DataSyncHandler<T> {
    key: String,
    name_of: NameFn<T>,
    current: CurrentFn<T>,
    writer: WriterFn<T>,
    collector: CollectorFn<T>,
    always_force_apply: bool,
}

impl<T> DataSyncHandler<T> {
    pub fn builder() -> DataSyncHandlerBuilder<T> {
        DataSyncHandlerBuilder::default()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn always_force_apply(&self) -> bool {
        self.always_force_apply
    }
}

/// Builder for [`DataSyncHandler`]. Every part but `always_force_apply` is required.
pub struct DataSyncHandlerBuilder<T> {
    key: Option<String>,
    name_of: Option<NameFn<T>>,
    current: Option<CurrentFn<T>>,
    writer: Option<WriterFn<T>>,
    collector: Option<CollectorFn<T>>,
    always_force_apply: bool,
}

impl<T> Default for DataSyncHandlerBuilder<T> {
    fn default() -> Self {
        Self {
            key: None,
            name_of: None,
            current: None,
            writer: None,
            collector: None,
            always_force_apply: false,
        }
    }
}

impl<T> DataSyncHandlerBuilder<T> {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Identity of an item within the category.
    pub fn name_extractor(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.name_of = Some(Arc::new(f));
        self
    }

    /// Current local item by name.
    pub fn current_getter(
        mut self,
        f: impl Fn(&str) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.current = Some(Arc::new(f));
        self
    }

    pub fn writer(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.writer = Some(Arc::new(f));
        self
    }

    /// Every local item, used for outbound sync.
    pub fn data_collector(mut self, f: impl Fn() -> Vec<T> + Send + Sync + 'static) -> Self {
        self.collector = Some(Arc::new(f));
        self
    }

    pub fn always_force_apply(mut self, always: bool) -> Self {
        self.always_force_apply = always;
        self
    }

    pub fn build(self) -> Result<DataSyncHandler<T>, SyncError> {
        let key = self
            .key
            .filter(|key| !key.is_empty())
            .ok_or(SyncError::MissingField("key"))?;
        Ok(DataSyncHandler {
            name_of: self.name_of.ok_or(SyncError::MissingField("name_extractor"))?,
            current: self.current.ok_or(SyncError::MissingField("current_getter"))?,
            writer: self.writer.ok_or(SyncError::MissingField("writer"))?,
            collector: self.collector.ok_or(SyncError::MissingField("data_collector"))?,
            always_force_apply: self.always_force_apply,
            key,
        })
    }
}

/// Object-safe view of a [`DataSyncHandler`] over JSON items.
pub(crate) trait ErasedSyncHandler: Send + Sync {
    fn key(&self) -> &str;

    /// Apply `incoming` items and return the local items the sender lacks.
    ///
    /// `None` means the sender did not mention this key at all.
    fn handle(&self, incoming: Option<&[Value]>, force: bool) -> Vec<Value>;

    /// Every local item.
    fn collect(&self) -> Vec<Value>;
}

impl<T> DataSyncHandler<T>
where
    T: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static,
{
    fn should_apply(&self, incoming: &T, force: bool) -> bool {
        if force || self.always_force_apply {
            return true;
        }
        (self.current)(&(self.name_of)(incoming)).as_ref() != Some(incoming)
    }

    fn encode(&self, items: Vec<T>) -> Vec<Value> {
        items
            .into_iter()
            .filter_map(|item| match serde_json::to_value(&item) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Failed to encode sync item");
                    None
                }
            })
            .collect()
    }
}

impl<T> ErasedSyncHandler for DataSyncHandler<T>
where
    T: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn handle(&self, incoming: Option<&[Value]>, force: bool) -> Vec<Value> {
        let mut seen = HashSet::new();
        for value in incoming.unwrap_or_default() {
            let item: T = match serde_json::from_value(value.clone()) {
                Ok(item) => item,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Dropping undecodable sync item");
                    continue;
                }
            };
            seen.insert((self.name_of)(&item));
            if self.should_apply(&item, force) {
                (self.writer)(item);
            }
        }

        let missing = (self.collector)()
            .into_iter()
            .filter(|item| !seen.contains(&(self.name_of)(item)))
            .collect();
        self.encode(missing)
    }

    fn collect(&self) -> Vec<Value> {
        self.encode((self.collector)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        value: u32,
    }

    fn item(name: &str, value: u32) -> Item {
        Item {
            name: name.to_string(),
            value,
        }
    }

    fn handler(
        store: Arc<Mutex<BTreeMap<String, Item>>>,
        writes: Arc<AtomicUsize>,
        always_force: bool,
    ) -> DataSyncHandler<Item> {
        let current = store.clone();
        let writer = store.clone();
        DataSyncHandler::builder()
            .key("items")
            .name_extractor(|i: &Item| i.name.clone())
            .current_getter(move |name| current.lock().unwrap().get(name).cloned())
            .writer(move |i: Item| {
                writes.fetch_add(1, Ordering::SeqCst);
                writer.lock().unwrap().insert(i.name.clone(), i);
            })
            .data_collector(move || store.lock().unwrap().values().cloned().collect())
            .always_force_apply(always_force)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_parts() {
        let missing = DataSyncHandler::<Item>::builder().key("items").build();
        assert!(matches!(missing, Err(SyncError::MissingField("name_extractor"))));
        let no_key = DataSyncHandler::<Item>::builder().build();
        assert!(matches!(no_key, Err(SyncError::MissingField("key"))));
    }

    #[test]
    fn test_equal_items_are_not_rewritten() {
        let store = Arc::new(Mutex::new(BTreeMap::new()));
        let writes = Arc::new(AtomicUsize::new(0));
        let handler = handler(store.clone(), writes.clone(), false);
        let incoming = vec![serde_json::to_value(item("a", 1)).unwrap()];

        handler.handle(Some(&incoming), false);
        let after_first = store.lock().unwrap().clone();
        handler.handle(Some(&incoming), false);

        assert_eq!(*store.lock().unwrap(), after_first);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_always_writes() {
        let store = Arc::new(Mutex::new(BTreeMap::from([("a".to_string(), item("a", 1))])));
        let writes = Arc::new(AtomicUsize::new(0));
        let handler = handler(store, writes.clone(), false);
        let incoming = vec![serde_json::to_value(item("a", 1)).unwrap()];

        handler.handle(Some(&incoming), true);
        handler.handle(Some(&incoming), true);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_always_force_handler_writes_equal_items() {
        let store = Arc::new(Mutex::new(BTreeMap::from([("a".to_string(), item("a", 1))])));
        let writes = Arc::new(AtomicUsize::new(0));
        let handler = handler(store, writes.clone(), true);
        let incoming = vec![serde_json::to_value(item("a", 1)).unwrap()];

        handler.handle(Some(&incoming), false);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backfill_and_bad_items() {
        let store = Arc::new(Mutex::new(BTreeMap::from([
            ("a".to_string(), item("a", 1)),
            ("b".to_string(), item("b", 2)),
        ])));
        let writes = Arc::new(AtomicUsize::new(0));
        let handler = handler(store.clone(), writes, false);

        let incoming = vec![
            serde_json::to_value(item("a", 5)).unwrap(),
            serde_json::json!({ "unexpected": true }),
        ];
        let missing = handler.handle(Some(&incoming), false);

        assert_eq!(missing, vec![serde_json::to_value(item("b", 2)).unwrap()]);
        assert_eq!(store.lock().unwrap()["a"].value, 5);

        // absent key: everything is missing on the other side
        assert_eq!(handler.handle(None, false).len(), 2);
        assert_eq!(handler.collect().len(), 2);
    }
}
