use crate::errors::{ControllerError, ExtKubeApiError};

use async_trait::async_trait;
use ingress_manager_apis::{MANAGER, ObjectKey};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, PostParams},
};
use kube_runtime::reflector::{ObjectRef, Store};
use log::{debug, info};
use std::{hash::Hash, sync::Arc};

/// Read access to the locally cached state of one resource kind.
pub(crate) trait Lister<K>: Send + Sync {
    /// Latest cached object for `key`, `Ok(None)` if it does not exist.
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, ControllerError>;
}

impl<K> Lister<K> for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, ControllerError> {
        let mut obj_ref = ObjectRef::<K>::new(key.name.as_str());
        if !key.namespace.is_empty() {
            obj_ref = obj_ref.within(key.namespace.as_str());
        }
        Ok(Store::get(self, &obj_ref))
    }
}

/// Write operations on Ingress objects.
#[async_trait]
pub(crate) trait IngressApi: Send + Sync {
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError>;
    /// Deleting an Ingress which does not exist succeeds.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError>;
}

/// [`IngressApi`] backed by the Kubernetes API server.
pub(crate) struct KubeIngressApi {
    client: Client,
}

impl KubeIngressApi {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl IngressApi for KubeIngressApi {
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError> {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("");
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        match self.namespaced_api(namespace).create(&pp, ingress).await {
            Ok(created) => {
                info!(
                    "created ingress {}/{}",
                    namespace,
                    created.metadata.name.as_deref().unwrap_or("")
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // The cache has not seen the Ingress yet, the next sync will.
                debug!(
                    "ingress {}/{} already exists: {}",
                    namespace,
                    ingress.metadata.name.as_deref().unwrap_or(""),
                    e
                );
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match self
            .namespaced_api(key.namespace.as_str())
            .delete(key.name.as_str(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("deleted ingress {}", key);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(
                    "tried to delete ingress {}, but it does no longer exist: {}",
                    key, e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
