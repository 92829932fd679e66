//! Service registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gate_packet::{Error, Result};

use crate::service::{Factory, Service};

/// Longest accepted service name.
pub const MAX_SERVICE_NAME_LEN: usize = 127;

/// Factories by service name.
///
/// A registry may be layered on a parent with [`Registry::clone_layer`]:
/// lookups fall through to the parent, registrations stay in the layer.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, Arc<dyn Factory>>,
    parent: Option<Arc<Registry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Names must be unique across all layers.
    pub fn register(&mut self, factory: Arc<dyn Factory>) -> Result<()> {
        let service = factory.service();
        check_name(&service.name)?;
        if self.lookup(&service.name).is_some() {
            return Err(Error::Conflict(format!(
                "duplicate service: {}",
                service.name
            )));
        }
        tracing::debug!(service = %service.name, revision = %service.revision, "registered");
        self.factories.insert(service.name, factory);
        Ok(())
    }

    /// An empty layer on top of this registry.
    pub fn clone_layer(self: &Arc<Self>) -> Registry {
        Registry {
            factories: BTreeMap::new(),
            parent: Some(self.clone()),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Factory>> {
        match self.factories.get(name) {
            Some(factory) => Some(factory.clone()),
            None => self.parent.as_ref().and_then(|p| p.lookup(name)),
        }
    }

    /// Descriptions of every reachable service, sorted by name.
    pub fn catalog(&self) -> Vec<Service> {
        let mut services = self
            .parent
            .as_ref()
            .map(|p| p.catalog())
            .unwrap_or_default();
        services.extend(self.factories.values().map(|f| f.service()));
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn len(&self) -> usize {
        self.factories.len() + self.parent.as_ref().map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.factories.keys().collect::<Vec<_>>())
            .field("parent", &self.parent)
            .finish()
    }
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(Error::internal(
            "invalid service registration",
            format!("invalid service name {name:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Instance, InstanceConfig};
    use async_trait::async_trait;
    use gate_packet::ErrorKind;
    use tokio_util::sync::CancellationToken;

    struct Named(&'static str);

    #[async_trait]
    impl Factory for Named {
        fn service(&self) -> Service {
            Service::new(self.0, "1")
        }

        async fn create_instance(
            &self,
            _ctx: &CancellationToken,
            _config: InstanceConfig,
            _snapshot: Option<&[u8]>,
        ) -> Result<Arc<dyn Instance>> {
            Err(Error::NotFound("unused".into()))
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Named("echo"))).unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_is_conflict() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Named("echo"))).unwrap();
        let err = registry.register(Arc::new(Named("echo"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn invalid_names_rejected() {
        let mut registry = Registry::new();
        for name in ["", "has space", "tab\t"] {
            let err = registry.register(Arc::new(Named(name))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Internal);
        }
        let long: &'static str = Box::leak("x".repeat(128).into_boxed_str());
        assert!(registry.register(Arc::new(Named(long))).is_err());
    }

    #[test]
    fn layers_fall_through() {
        let mut base = Registry::new();
        base.register(Arc::new(Named("base"))).unwrap();
        let base = Arc::new(base);

        let mut layer = base.clone_layer();
        layer.register(Arc::new(Named("extra"))).unwrap();
        assert!(layer.lookup("base").is_some());
        assert!(layer.lookup("extra").is_some());
        assert!(base.lookup("extra").is_none());

        // Parent names stay reserved.
        assert!(layer.register(Arc::new(Named("base"))).is_err());
    }

    #[test]
    fn catalog_is_sorted() {
        let mut base = Registry::new();
        base.register(Arc::new(Named("zeta"))).unwrap();
        let base = Arc::new(base);
        let mut layer = base.clone_layer();
        layer.register(Arc::new(Named("alpha"))).unwrap();

        let names: Vec<String> = layer.catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
