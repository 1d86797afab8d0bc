#[macro_use]
extern crate log;

use anyhow::Context;
use ingress_manager_apis::{RouteTemplate, TRIGGER_ANNOTATION};
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::{Api, Client, Resource};
use kube_runtime::watcher;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use serde::de::DeserializeOwned;
use std::{collections::HashSet, fmt::Debug, net::SocketAddr, sync::Arc};

mod cache;
mod dispatcher;
mod errors;
mod handlers;
mod informer;
mod prometheus_exporter;
mod rate_limiter;
mod reconciler;
mod retry;
#[cfg(test)]
mod test_utils;
mod utils;
mod work_queue;

use cache::KubeIngressApi;
use dispatcher::{Dispatcher, WORKERS};
use handlers::{Enqueuer, IngressEventHandler, ServiceEventHandler};
use informer::Informer;
use rate_limiter::default_controller_rate_limiter;
use reconciler::Reconciler;
use retry::{LogErrorObserver, MAX_RETRY, RetryPolicy};
use work_queue::WorkQueue;

const QUEUE_NAME: &'static str = "ingressManager";

#[derive(Clone, Debug)]
struct Configuration {
    workers: usize,
    max_retry: u32,
    trigger_annotation: String,
    route_template: RouteTemplate,
    watch_namespaces: Option<HashSet<String>>,
    metrics_addr: SocketAddr,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let workers = match var("WORKERS") {
            Some(v) => v.parse().context("invalid WORKERS")?,
            None => WORKERS,
        };
        if workers == 0 {
            anyhow::bail!("invalid WORKERS: at least one worker is required");
        }
        let max_retry = match var("MAX_RETRY") {
            Some(v) => v.parse().context("invalid MAX_RETRY")?,
            None => MAX_RETRY,
        };
        let mut route_template: RouteTemplate = match var("INGRESS_ROUTE_TEMPLATE") {
            Some(v) => serde_json::from_str(&v).context("invalid INGRESS_ROUTE_TEMPLATE")?,
            None => Default::default(),
        };
        if let Some(host) = var("INGRESS_HOST") {
            route_template.host = host;
        }
        if let Some(path) = var("INGRESS_PATH") {
            route_template.path = path;
        }
        if let Some(port) = var("INGRESS_BACKEND_PORT") {
            route_template.port = port.parse().context("invalid INGRESS_BACKEND_PORT")?;
        }
        if let Some(class) = var("INGRESS_CLASS_NAME") {
            route_template.ingress_class_name = Some(class);
        }
        route_template.validate()?;
        let watch_namespaces: Option<HashSet<String>> = var("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let metrics_addr = var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port)
            .parse()
            .context("invalid metrics listen address")?;
        Ok(Configuration {
            workers,
            max_retry,
            trigger_annotation: var("TRIGGER_ANNOTATION")
                .unwrap_or_else(|| TRIGGER_ANNOTATION.to_string()),
            route_template,
            watch_namespaces,
            metrics_addr,
        })
    }

    /// Optimize for the use-case where exactly one watch-namespace is provided.
    fn api<K>(&self, client: Client) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let mut tmp = self.watch_namespaces.iter().flatten();
        if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            Api::namespaced(client, ns.as_str())
        } else {
            Api::all(client)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    // Another provider may already be installed, which is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let configuration = Configuration::from_env()?;
    match &configuration.watch_namespaces {
        Some(namespaces) => {
            let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
            info!(
                "Controller is watching resources in namespaces: {}",
                namespaces.join(",")
            );
        }
        None => info!("Controller is watching resources in all namespaces"),
    }

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    global::set_meter_provider(SdkMeterProvider::builder().with_reader(exporter).build());
    let metrics_server = start_prometheus_metrics_server(configuration.metrics_addr, registry);

    let client = Client::try_default().await?;
    let queue = WorkQueue::new(QUEUE_NAME, default_controller_rate_limiter());
    let enqueuer = Enqueuer::new(
        queue.clone(),
        configuration.watch_namespaces.clone().map(Arc::new),
    );

    let service_informer = Informer::<Service>::new();
    let ingress_informer = Informer::<Ingress>::new();
    let services = service_informer.store();
    let ingresses = ingress_informer.store();
    let service_watch = service_informer.run(
        configuration.api::<Service>(client.clone()),
        watcher::Config::default(),
        Arc::new(ServiceEventHandler::new(enqueuer.clone())),
    );
    let ingress_watch = ingress_informer.run(
        configuration.api::<Ingress>(client.clone()),
        watcher::Config::default(),
        Arc::new(IngressEventHandler::new(enqueuer)),
    );

    let reconciler = Reconciler::new(
        Arc::new(services.clone()),
        Arc::new(ingresses.clone()),
        Arc::new(KubeIngressApi::new(client)),
        configuration.trigger_annotation.clone(),
        configuration.route_template.clone(),
    );
    let retry = RetryPolicy::new(configuration.max_retry, Arc::new(LogErrorObserver::new()));
    let dispatcher = Dispatcher::new(queue, Arc::new(reconciler), retry, configuration.workers);
    let controller = async move {
        if services.wait_until_ready().await.is_err()
            || ingresses.wait_until_ready().await.is_err()
        {
            error!("caches were dropped before they got ready");
            return;
        }
        info!("caches synced");
        dispatcher.run(shutdown_signal()).await;
    };

    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       _ = service_watch => (),
       _ = ingress_watch => (),
       r = metrics_server => r?,
    };
    Ok(())
}
