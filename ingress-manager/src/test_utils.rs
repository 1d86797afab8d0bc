//! In-memory stand-ins for the cluster used by unit tests.

use crate::{
    cache::{IngressApi, Lister},
    errors::ControllerError,
    retry::ErrorObserver,
};

use async_trait::async_trait;
use ingress_manager_apis::{ObjectKey, TRIGGER_ANNOTATION};
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::api::ObjectMeta;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

#[derive(Default)]
pub(crate) struct RecordingObserver {
    errors: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorObserver for RecordingObserver {
    fn observe(&self, key: &str, _error: &ControllerError) {
        self.errors.lock().unwrap().push(key.to_string());
    }
}

pub(crate) fn service(namespace: &str, name: &str, annotated: bool) -> Service {
    let mut annotations = BTreeMap::new();
    if annotated {
        annotations.insert(TRIGGER_ANNOTATION.to_string(), "".to_string());
    }
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[derive(Default)]
struct State {
    services: HashMap<ObjectKey, Arc<Service>>,
    ingresses: HashMap<ObjectKey, Arc<Ingress>>,
    creates: usize,
    deletes: usize,
    fail_creates: bool,
    fail_lookups: bool,
    fail_ingress_lookups: bool,
}

/// Cache and API in one: creates and deletes are visible to the next lookup.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put_service(&self, service: Service) {
        let key = ObjectKey::from_resource(&service).unwrap();
        self.state
            .lock()
            .unwrap()
            .services
            .insert(key, Arc::new(service));
    }

    pub(crate) fn remove_service(&self, key: &ObjectKey) {
        self.state.lock().unwrap().services.remove(key);
    }

    pub(crate) fn put_ingress(&self, ingress: Ingress) {
        let key = ObjectKey::from_resource(&ingress).unwrap();
        self.state
            .lock()
            .unwrap()
            .ingresses
            .insert(key, Arc::new(ingress));
    }

    pub(crate) fn ingress(&self, key: &ObjectKey) -> Option<Arc<Ingress>> {
        self.state.lock().unwrap().ingresses.get(key).cloned()
    }

    pub(crate) fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.state.lock().unwrap().fail_lookups = fail;
    }

    /// Fail Ingress lookups only, Service lookups keep working.
    pub(crate) fn fail_ingress_lookups(&self, fail: bool) {
        self.state.lock().unwrap().fail_ingress_lookups = fail;
    }

    /// Number of create and delete calls so far.
    pub(crate) fn calls(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.creates, state.deletes)
    }
}

impl Lister<Service> for FakeCluster {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Service>>, ControllerError> {
        let state = self.state.lock().unwrap();
        if state.fail_lookups {
            return Err(anyhow::anyhow!("lookup failed").into());
        }
        Ok(state.services.get(key).cloned())
    }
}

impl Lister<Ingress> for FakeCluster {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Ingress>>, ControllerError> {
        let state = self.state.lock().unwrap();
        if state.fail_lookups || state.fail_ingress_lookups {
            return Err(anyhow::anyhow!("lookup failed").into());
        }
        Ok(state.ingresses.get(key).cloned())
    }
}

#[async_trait]
impl IngressApi for FakeCluster {
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.creates += 1;
        if state.fail_creates {
            return Err(anyhow::anyhow!("create rejected").into());
        }
        let key = ObjectKey::from_resource(ingress).unwrap();
        state.ingresses.insert(key, Arc::new(ingress.clone()));
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        state.deletes += 1;
        state.ingresses.remove(key);
        Ok(())
    }
}
