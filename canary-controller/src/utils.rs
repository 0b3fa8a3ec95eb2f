use canary_controller_apis::Canary;
use kube::{api::ListParams, Api, Client};
use semver::{Version, VersionReq};

use crate::errors::{ControllerError, ExtKubeApiError};

/// Lowest supported Kubernetes version, any later 1.x release is accepted.
const KUBERNETES_VERSION_CONSTRAINT: &'static str = "^1.11.0";

pub(crate) fn metric_name(name: &str) -> String {
    format!("canary_controller_{}", name)
}

/// Fail unless the Canary CRD is served, probed with a single item list.
pub(crate) async fn verify_crds(canaries: &Api<Canary>) -> Result<(), ControllerError> {
    match canaries.list(&ListParams::default().limit(1)).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err(ControllerError::CrdNotRegistered(e)),
        Err(e) => Err(e)?,
    }
}

pub(crate) async fn verify_kubernetes_version(client: &Client) -> Result<(), ControllerError> {
    let info = client.apiserver_version().await?;
    check_kubernetes_version(&info.git_version)?;
    info!("Connected to Kubernetes API {}", info.git_version);
    Ok(())
}

fn supported_versions() -> Result<VersionReq, ControllerError> {
    VersionReq::parse(KUBERNETES_VERSION_CONSTRAINT).map_err(|e| {
        ControllerError::Configuration(format!(
            "invalid kubernetes version constraint {}: {}",
            KUBERNETES_VERSION_CONSTRAINT, e
        ))
    })
}

/// Check a server `gitVersion` like `v1.27.3-eks-2d98532`. Vendor suffixes are
/// ignored.
pub(crate) fn check_kubernetes_version(git_version: &str) -> Result<Version, ControllerError> {
    let version = Version::parse(git_version.trim().trim_start_matches('v'))
        .map_err(|e| ControllerError::InvalidKubernetesVersion(git_version.to_string(), e))?;
    let release = Version::new(version.major, version.minor, version.patch);
    if supported_versions()?.matches(&release) {
        Ok(version)
    } else {
        Err(ControllerError::UnsupportedKubernetesVersion {
            expected: KUBERNETES_VERSION_CONSTRAINT.to_string(),
            actual: git_version.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::unreachable_client;

    #[test]
    fn metric_names_are_prefixed() {
        assert_eq!("canary_controller_reconcile_count", metric_name("reconcile_count"));
    }

    #[test]
    fn version_constraint_is_caret_1_11() {
        let req = supported_versions().unwrap();
        assert_eq!("^1.11.0", req.to_string());
        assert!(req.matches(&Version::new(1, 11, 0)));
        assert!(!req.matches(&Version::new(1, 10, 99)));
    }

    #[test]
    fn accepts_supported_versions() {
        for v in ["v1.11.0", "v1.33.1", "v1.27.3-eks-2d98532", "v1.28.2+k3s1", "v1.11.0-alpha.1", "1.20.0"] {
            assert!(check_kubernetes_version(v).is_ok(), "{} should be supported", v);
        }
    }

    #[test]
    fn rejects_unsupported_versions() {
        for v in ["v1.10.13", "v2.0.0", "v0.9.0"] {
            assert!(
                matches!(
                    check_kubernetes_version(v),
                    Err(ControllerError::UnsupportedKubernetesVersion { .. })
                ),
                "{} should be rejected",
                v
            );
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            check_kubernetes_version("latest"),
            Err(ControllerError::InvalidKubernetesVersion(..))
        ));
    }

    #[tokio::test]
    async fn unreachable_api_is_not_a_missing_crd() {
        let canaries: Api<Canary> = Api::all(unreachable_client());
        assert!(matches!(
            verify_crds(&canaries).await,
            Err(ControllerError::KubeApi(_))
        ));
    }
}
