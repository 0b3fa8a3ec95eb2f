use canary_controller_apis::Canary;
use kube::ResourceExt;

/// Stable identity of a watched object, used as work queue token and
/// snapshot table key.
///
/// Only ever derived from `metadata.name` and `metadata.namespace`, never from
/// content that changes between revisions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: &str, name: &str) -> Option<Self> {
        if namespace.is_empty() || name.is_empty() {
            None
        } else {
            Some(Self {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Key of the given object, `None` if it lacks a name or namespace.
    pub fn from_object(canary: &Canary) -> Option<Self> {
        let namespace = canary.namespace()?;
        Self::new(namespace.as_str(), canary.metadata.name.as_deref()?)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_controller_apis::CanarySpec;
    use kube::api::ObjectMeta;

    fn canary(name: Option<&str>, namespace: Option<&str>, version: &str) -> Canary {
        Canary {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            spec: CanarySpec {
                image: Some(format!("nginx:{}", version)),
                cron: "@hourly".to_string(),
                replicas: 1,
            },
        }
    }

    #[test]
    fn renders_name_dot_namespace() {
        let key = ResourceKey::new("default", "foo").unwrap();
        assert_eq!("foo.default", key.to_string());
    }

    #[test]
    fn ignores_resource_version_and_spec() {
        let a = ResourceKey::from_object(&canary(Some("foo"), Some("default"), "1"));
        let b = ResourceKey::from_object(&canary(Some("foo"), Some("default"), "2"));
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn requires_name_and_namespace() {
        assert!(ResourceKey::from_object(&canary(None, Some("default"), "1")).is_none());
        assert!(ResourceKey::from_object(&canary(Some("foo"), None, "1")).is_none());
        assert!(ResourceKey::from_object(&canary(Some(""), Some("default"), "1")).is_none());
    }
}
