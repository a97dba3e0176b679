//! Versioned registries mapping orchestration, activity and entity names to
//! handler implementations.
//!
//! Orchestrations may register multiple semver versions of the same name; an
//! instance is pinned to the version recorded in its started event so that
//! in-flight histories keep replaying against the code that produced them.
//! Activities and entities register at 1.0.0 and always resolve latest.

use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::entities::EntityHandler;
use super::{ActivityHandler, FnActivity, FnEntity, FnOrchestration, OrchestrationHandler};
use crate::{ActivityContext, OrchestrationContext};

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Immutable name -> versions -> handler map. Cheap to clone.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type EntityRegistry = Registry<dyn EntityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn EntityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder { map: HashMap::new() }
    }

    /// Highest registered version for a name.
    pub fn resolve_latest(&self, name: &str) -> Option<(Version, Arc<H>)> {
        self.inner
            .get(name)
            .and_then(|m| m.iter().next_back())
            .map(|(v, h)| (v.clone(), Arc::clone(h)))
    }

    /// Exact version lookup, used when replaying a pinned instance.
    pub fn resolve_exact(&self, name: &str, version: &Version) -> Option<Arc<H>> {
        self.inner.get(name).and_then(|m| m.get(version)).map(Arc::clone)
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    fn insert(&mut self, name: String, version: Version, handler: Arc<H>) {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&version) {
            panic!("duplicate registration: {name}@{version}");
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!("non-monotonic version for {name}: {version} is not later than {latest}");
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let version = Version::parse(version.as_ref()).expect("orchestration version must be valid semver");
        self.insert(name.into(), version, Arc::new(FnOrchestration(f)));
        self
    }

    /// Register with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input: String| {
            let f = f.clone();
            async move {
                let decoded: In = crate::codec::decode(&input)?;
                let out = f(ctx, decoded).await?;
                crate::codec::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(wrapper)));
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(f)));
        self
    }

    /// Register with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input: String| {
            let f = f.clone();
            async move {
                let decoded: In = crate::codec::decode(&input)?;
                let out = f(ctx, decoded).await?;
                crate::codec::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnActivity(wrapper)));
        self
    }
}

impl EntityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(super::entities::EntityContext, String, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnEntity(f)));
        self
    }
}
