use canary_controller_apis::{Canary, CanarySpec};
use kube::{api::ObjectMeta, Client};

pub(crate) fn canary(name: &str, namespace: &str, resource_version: &str) -> Canary {
    Canary {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            uid: Some(format!("uid-{}-{}", namespace, name)),
            ..Default::default()
        },
        spec: CanarySpec {
            image: Some("ghcr.io/example/podinfo:6.0.0".to_string()),
            cron: "*/5 * * * *".to_string(),
            replicas: 2,
        },
    }
}

/// A client for an API server which refuses every connection.
pub(crate) fn unreachable_client() -> Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let url: hyper::Uri = "http://127.0.0.1:1".parse().unwrap();
    Client::try_from(kube::Config::new(url)).unwrap()
}
