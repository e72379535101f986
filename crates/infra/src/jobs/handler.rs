//! Job handlers and kind-based routing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::{Job, JobError};

/// Executes the work described by a job.
///
/// Delivery is at-least-once: a handler may see the same job again after a
/// crash or lease expiry, so its effects must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (**self).handle(job).await
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler. The closure receives an owned copy of the job.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        (self.0)(job.clone()).await
    }
}

/// Routes jobs to handlers by `kind`.
///
/// Patterns are matched in order: exact kind, then the longest `"prefix.*"`
/// category, then `"*"`. A job with no matching handler fails fatally.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind pattern, replacing any previous one.
    pub fn register(&mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn with(mut self, pattern: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(pattern, handler);
        self
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn resolve(&self, kind: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h);
        }

        // Category match, e.g. "notification.*" matches "notification.email"
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.patterns().collect();
        patterns.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let kind = job.kind.as_deref().unwrap_or_default();
        match self.resolve(kind) {
            Some(handler) => handler.handle(job).await,
            None => Err(JobError::fatal(format!(
                "no handler registered for job kind {kind:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fintrack_core::QueueName;
    use serde_json::json;

    use super::*;

    fn job(kind: &str) -> Job {
        Job::new(QueueName::from_static("messages"), json!({})).with_kind(kind)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl JobHandler + 'static {
        let counter = counter.clone();
        handler_fn(move |_job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn exact_match_wins_over_category() {
        let exact = Arc::new(AtomicUsize::new(0));
        let category = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new()
            .with("notification.email", counting(&exact))
            .with("notification.*", counting(&category));

        registry.handle(&job("notification.email")).await.unwrap();
        registry.handle(&job("notification.sms")).await.unwrap();

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(category.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn longest_category_wins() {
        let broad = Arc::new(AtomicUsize::new(0));
        let narrow = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new()
            .with("notification.*", counting(&broad))
            .with("notification.push.*", counting(&narrow));

        registry.handle(&job("notification.push.ios")).await.unwrap();

        assert_eq!(broad.load(Ordering::SeqCst), 0);
        assert_eq!(narrow.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn category_requires_a_segment_boundary() {
        let registry = HandlerRegistry::new().with("report.*", counting(&Arc::default()));
        assert!(registry.resolve("reporting.daily").is_none());
        assert!(registry.resolve("report.daily").is_some());
    }

    #[tokio::test]
    async fn wildcard_catches_everything_else() {
        let any = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().with("*", counting(&any));

        registry.handle(&job("anything")).await.unwrap();
        registry
            .handle(&Job::new(QueueName::from_static("messages"), json!({})))
            .await
            .unwrap();

        assert_eq!(any.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_kind_fails_fatally() {
        let registry = HandlerRegistry::new();
        let err = registry.handle(&job("mystery")).await.unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
    }
}
