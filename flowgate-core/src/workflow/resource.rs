//! Task resource handlers and their registry

use crate::workflow::error::ResourceError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Resource prefix that parks a Task until an event is injected
pub const EVENT_PREFIX: &str = "event:";

/// External work invoked by Task states
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Invoke `resource` with the state's effective input
    ///
    /// # Returns
    /// The raw result, placed into the state's data by `ResultPath`
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, ResourceError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ResourceHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ResourceError>> + Send,
{
    async fn invoke(&self, _resource: &str, input: Value) -> Result<Value, ResourceError> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ResourceHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ResourceError>> + Send + 'static,
{
    Arc::new(FnHandler::new(f))
}

/// Returns its input unchanged
pub struct EchoHandler;

#[async_trait]
impl ResourceHandler for EchoHandler {
    async fn invoke(&self, _resource: &str, input: Value) -> Result<Value, ResourceError> {
        Ok(input)
    }
}

/// Routes resource names to handlers.
///
/// Exact names win over prefixes; among prefixes the longest match wins.
#[derive(Default)]
pub struct ResourceRegistry {
    exact: DashMap<String, Arc<dyn ResourceHandler>>,
    prefixes: DashMap<String, Arc<dyn ResourceHandler>>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers:
    /// `builtin:echo`, `command:<shell command>`, `http://` and `https://` URLs
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("builtin:echo", Arc::new(EchoHandler));
        registry.register_prefix(
            crate::workflow::command_handler::COMMAND_PREFIX,
            Arc::new(crate::workflow::command_handler::CommandHandler::new()),
        );
        let http: Arc<dyn ResourceHandler> = Arc::new(crate::workflow::http_handler::HttpHandler::new());
        registry.register_prefix("http://", http.clone());
        registry.register_prefix("https://", http);
        registry
    }

    /// Register a handler for one resource name
    pub fn register(&self, resource: &str, handler: Arc<dyn ResourceHandler>) {
        self.exact.insert(resource.to_string(), handler);
    }

    /// Register a handler for every resource starting with `prefix`
    pub fn register_prefix(&self, prefix: &str, handler: Arc<dyn ResourceHandler>) {
        self.prefixes.insert(prefix.to_string(), handler);
    }

    /// Find the handler for `resource`
    pub fn resolve(&self, resource: &str) -> Option<Arc<dyn ResourceHandler>> {
        if let Some(handler) = self.exact.get(resource) {
            return Some(handler.value().clone());
        }
        self.prefixes
            .iter()
            .filter(|entry| resource.starts_with(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| entry.value().clone())
    }

    /// Registered exact names and prefixes, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .exact
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.prefixes.iter().map(|entry| format!("{}*", entry.key())))
            .collect();
        names.sort();
        names
    }
}
