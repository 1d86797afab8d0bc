//! Turns Service and Ingress changes into work queue keys.

use crate::{informer::ResourceEventHandler, utils::is_watched, work_queue::WorkQueue};

use ingress_manager_apis::{ObjectKey, SOURCE_KIND, controller_of};
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::Resource;
use log::{debug, error};
use std::{collections::HashSet, sync::Arc};

/// Why a Service has to be reconciled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Notification {
    /// The Service was added or changed.
    SourceChanged(ObjectKey),
    /// An Ingress owned by a Service was deleted.
    DerivedDeleted(ObjectKey),
}

impl Notification {
    pub(crate) fn key(&self) -> &ObjectKey {
        match self {
            Notification::SourceChanged(key) | Notification::DerivedDeleted(key) => key,
        }
    }
}

fn key_of<K>(obj: &K) -> Option<ObjectKey>
where
    K: Resource,
    K::DynamicType: Default,
{
    let key = ObjectKey::from_resource(obj);
    if key.is_none() {
        error!(
            "cannot compute key of {} without name",
            K::kind(&Default::default())
        );
    }
    key
}

/// Enqueues notifications of watched namespaces.
#[derive(Clone)]
pub(crate) struct Enqueuer {
    queue: WorkQueue,
    watch_namespaces: Option<Arc<HashSet<String>>>,
}

impl Enqueuer {
    pub(crate) fn new(queue: WorkQueue, watch_namespaces: Option<Arc<HashSet<String>>>) -> Self {
        Self {
            queue,
            watch_namespaces,
        }
    }

    pub(crate) fn enqueue(&self, notification: Notification) {
        let key = notification.key();
        if !is_watched(self.watch_namespaces.as_deref(), key.namespace.as_str()) {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch",
                key
            );
            return;
        }
        debug!("enqueue {:?}", notification);
        self.queue.add(key.to_string().as_str());
    }
}

/// Reconciles a Service whenever it is added or its content changed.
pub(crate) struct ServiceEventHandler {
    enqueuer: Enqueuer,
}

impl ServiceEventHandler {
    pub(crate) fn new(enqueuer: Enqueuer) -> Self {
        Self { enqueuer }
    }
}

impl ResourceEventHandler<Service> for ServiceEventHandler {
    fn on_add(&self, obj: &Service) {
        if let Some(key) = key_of(obj) {
            self.enqueuer.enqueue(Notification::SourceChanged(key));
        }
    }

    fn on_update(&self, old: &Service, new: &Service) {
        // Relists deliver unchanged objects again.
        if old == new {
            return;
        }
        if let Some(key) = key_of(new) {
            self.enqueuer.enqueue(Notification::SourceChanged(key));
        }
    }
}

/// Reconciles the owning Service when one of its Ingresses is deleted, so
/// the Ingress is recreated if the Service still asks for it.
pub(crate) struct IngressEventHandler {
    enqueuer: Enqueuer,
}

impl IngressEventHandler {
    pub(crate) fn new(enqueuer: Enqueuer) -> Self {
        Self { enqueuer }
    }
}

impl ResourceEventHandler<Ingress> for IngressEventHandler {
    fn on_delete(&self, obj: &Ingress) {
        match controller_of(obj) {
            Some(owner) if owner.kind == SOURCE_KIND => {
                if let Some(key) = key_of(obj) {
                    self.enqueuer.enqueue(Notification::DerivedDeleted(key));
                }
            }
            _ => (),
        }
    }
}
