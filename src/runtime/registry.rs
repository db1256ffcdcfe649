//! Name-to-handler registries for orchestrations and activities.
//!
//! Registries are built once at startup and read-only afterwards; the
//! `function_name -> handler` map is the single dispatch point in the engine.
//! Typed registration wraps a typed closure in a string-codec adapter so the
//! persisted payloads stay opaque strings.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{typed_codec, ActivityContext, OrchestrationContext};

/// Generic handler registry; orchestrations and activities share the shape.
pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> std::fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<H>> {
        let handler = self.inner.get(name).cloned();
        if handler.is_none() {
            tracing::debug!(
                target: "duratask::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        handler
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, surfacing any duplicate-registration errors instead of silently
    /// keeping the first handler.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    /// Merge another registry into this builder.
    pub fn merge(mut self, other: Registry<H>, kind: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {kind} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>, kind: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {kind} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = typed_codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                typed_codec::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = typed_codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                typed_codec::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }
}
