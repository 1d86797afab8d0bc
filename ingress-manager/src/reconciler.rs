use crate::{
    cache::{IngressApi, Lister},
    errors::ControllerError,
};

use async_trait::async_trait;
use ingress_manager_apis::{ObjectKey, RouteTemplate, construct_ingress, wants_ingress};
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use log::{debug, info};
use std::sync::Arc;

/// Brings the cluster in line with the current state of one key.
#[async_trait]
pub(crate) trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &str) -> Result<(), ControllerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncAction {
    Create,
    Delete,
    None,
}

/// What to do given whether the Service wants an Ingress and whether one exists.
pub(crate) fn plan(wants_ingress: bool, ingress_exists: bool) -> SyncAction {
    match (wants_ingress, ingress_exists) {
        (true, false) => SyncAction::Create,
        (false, true) => SyncAction::Delete,
        _ => SyncAction::None,
    }
}

/// Keeps one Ingress per annotated Service.
pub(crate) struct Reconciler {
    services: Arc<dyn Lister<Service>>,
    ingresses: Arc<dyn Lister<Ingress>>,
    api: Arc<dyn IngressApi>,
    trigger_annotation: String,
    template: RouteTemplate,
}

impl Reconciler {
    pub(crate) fn new(
        services: Arc<dyn Lister<Service>>,
        ingresses: Arc<dyn Lister<Ingress>>,
        api: Arc<dyn IngressApi>,
        trigger_annotation: String,
        template: RouteTemplate,
    ) -> Self {
        Self {
            services,
            ingresses,
            api,
            trigger_annotation,
            template,
        }
    }
}

#[async_trait]
impl SyncHandler for Reconciler {
    async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let key: ObjectKey = key.parse()?;
        let service = match self.services.get(&key)? {
            Some(service) => service,
            None => {
                // Owned Ingresses are garbage collected through their owner reference.
                debug!("service {} no longer exists", key);
                return Ok(());
            }
        };
        let wants = wants_ingress(&service, self.trigger_annotation.as_str());
        let exists = self.ingresses.get(&key)?.is_some();
        match plan(wants, exists) {
            SyncAction::Create => {
                let ingress = construct_ingress(&service, &self.template)?;
                self.api.create(&ingress).await?;
                info!(
                    "service {} has annotation {}, ingress created",
                    key, self.trigger_annotation
                );
            }
            SyncAction::Delete => {
                self.api.delete(&key).await?;
                info!(
                    "service {} lost annotation {}, ingress deleted",
                    key, self.trigger_annotation
                );
            }
            SyncAction::None => {
                debug!("service {} in sync (ingress wanted: {})", key, wants);
            }
        }
        Ok(())
    }
}
