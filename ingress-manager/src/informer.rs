use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, store::Writer},
    watcher::{self, Event, watcher},
};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use std::{collections::HashMap, fmt::Debug, sync::Arc};

/// Callbacks for changes of cached objects, invoked after the cache has been updated.
pub(crate) trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}
    fn on_update(&self, _old: &K, _new: &K) {}
    fn on_delete(&self, _obj: &K) {}
}

/// Keeps a [`Store`] in sync with a watch stream and reports every change to a
/// [`ResourceEventHandler`].
pub(crate) struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    writer: Writer<K>,
    reader: Store<K>,
    /// Objects listed since the last `Init`, `None` outside of a relist.
    relisted: Option<Vec<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    pub(crate) fn new() -> Self {
        let writer: Writer<K> = Default::default();
        let reader = writer.as_reader();
        Self {
            writer,
            reader,
            relisted: None,
        }
    }

    pub(crate) fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    pub(crate) fn apply(&mut self, event: Event<K>, handler: &dyn ResourceEventHandler<K>) {
        match event {
            Event::Apply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(&obj));
                self.writer.apply_watcher_event(&Event::Apply(obj.clone()));
                match old {
                    Some(old) => handler.on_update(old.as_ref(), &obj),
                    None => handler.on_add(&obj),
                }
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&Event::Delete(obj.clone()));
                handler.on_delete(&obj);
            }
            Event::Init => {
                self.relisted = Some(Vec::new());
                self.writer.apply_watcher_event(&Event::Init);
            }
            Event::InitApply(obj) => {
                self.relisted.get_or_insert_with(Vec::new).push(obj.clone());
                self.writer.apply_watcher_event(&Event::InitApply(obj));
            }
            Event::InitDone => {
                // The store still holds the state from before the relist.
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .reader
                    .state()
                    .into_iter()
                    .map(|o| (ObjectRef::from_obj(o.as_ref()), o))
                    .collect();
                self.writer.apply_watcher_event(&Event::InitDone);
                let relisted = self.relisted.take().unwrap_or_default();
                debug!("relisted {} objects", relisted.len());
                for obj in relisted {
                    match previous.remove(&ObjectRef::from_obj(&obj)) {
                        Some(old) => handler.on_update(old.as_ref(), &obj),
                        None => handler.on_add(&obj),
                    }
                }
                // Deleted while the watch was down.
                for (_, gone) in previous {
                    handler.on_delete(gone.as_ref());
                }
            }
        }
    }

    /// Watch `api` until the stream ends, feeding every event into the store and `handler`.
    pub(crate) async fn run(
        mut self,
        api: Api<K>,
        config: watcher::Config,
        handler: Arc<dyn ResourceEventHandler<K>>,
    ) {
        let mut stream = watcher(api, config).default_backoff().boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.apply(event, handler.as_ref()),
                Err(e) => warn!("watch of {} failed: {}", K::kind(&Default::default()), e),
            }
        }
        warn!(
            "watch stream of {} ended, {} objects cached",
            K::kind(&Default::default()),
            self.reader.state().len()
        );
    }
}
