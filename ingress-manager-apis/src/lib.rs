use std::{fmt, str::FromStr};

use k8s_openapi::{
    api::{
        core::v1::Service,
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Services carrying this annotation (any value) get an Ingress.
pub const TRIGGER_ANNOTATION: &'static str = "ingress/http";

/// Kind of the owner reference set on every managed Ingress.
pub const SOURCE_KIND: &'static str = "Service";

/// The K8s field manager name.
pub const MANAGER: &'static str = "ingress-manager";

const PATH_TYPES: [&'static str; 3] = ["Exact", "Prefix", "ImplementationSpecific"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("service has no {0}")]
    MissingField(&'static str),
    #[error("invalid path type {0:?}, expected one of Exact, Prefix, ImplementationSpecific")]
    InvalidPathType(String),
    #[error("invalid backend port {0}")]
    InvalidPort(i32),
    #[error("invalid path {0:?}, must start with '/'")]
    InvalidPath(String),
}

/// Identity of a namespaced object, rendered as `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Kubernetes object, `None` if the object has no name yet.
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        let meta: &ObjectMeta = obj.meta();
        let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(meta.namespace.as_deref().unwrap_or(""), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(ObjectKey::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(ObjectKey::new(*namespace, *name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

/// Shape of the single routing rule written into every managed Ingress.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteTemplate {
    /// Host matched by the rule, an empty host matches all hosts.
    pub host: String,
    pub path: String,
    /// One of `Exact`, `Prefix` or `ImplementationSpecific`.
    pub path_type: String,
    /// Port number of the backend Service.
    pub port: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
}

impl Default for RouteTemplate {
    fn default() -> Self {
        Self {
            host: "example.com".to_string(),
            path: "/".to_string(),
            path_type: "Prefix".to_string(),
            port: 80,
            ingress_class_name: None,
        }
    }
}

impl RouteTemplate {
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if !PATH_TYPES.contains(&self.path_type.as_str()) {
            return Err(ConstructionError::InvalidPathType(self.path_type.clone()));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(ConstructionError::InvalidPort(self.port));
        }
        if !self.path.starts_with('/') {
            return Err(ConstructionError::InvalidPath(self.path.clone()));
        }
        Ok(())
    }

    fn rule(&self, service_name: &str) -> IngressRule {
        IngressRule {
            host: Some(self.host.clone()).filter(|h| !h.is_empty()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(self.path.clone()),
                    path_type: self.path_type.clone(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service_name.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(self.port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }
    }
}

/// Whether the Service asks for an Ingress. Only presence of the annotation counts.
pub fn wants_ingress(service: &Service, annotation: &str) -> bool {
    service.annotations().contains_key(annotation)
}

/// Returns the owner reference flagged as managing controller, if any.
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Build the Ingress mirroring `service`: same name and namespace, owned by the
/// Service and routing `template` to the Service's port.
pub fn construct_ingress(
    service: &Service,
    template: &RouteTemplate,
) -> Result<Ingress, ConstructionError> {
    template.validate()?;
    let name = service
        .metadata
        .name
        .clone()
        .ok_or(ConstructionError::MissingField("name"))?;
    let namespace = service
        .metadata
        .namespace
        .clone()
        .ok_or(ConstructionError::MissingField("namespace"))?;
    // controller_owner_ref is None without a UID.
    let owner = service
        .controller_owner_ref(&())
        .ok_or(ConstructionError::MissingField("uid"))?;
    let rule = template.rule(name.as_str());
    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            owner_references: Some(vec![OwnerReference {
                block_owner_deletion: Some(true),
                ..owner
            }]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: template.ingress_class_name.clone(),
            rules: Some(vec![rule]),
            ..Default::default()
        }),
        status: None,
    })
}
