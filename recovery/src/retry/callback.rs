//! The task's own retry entry point

use std::future::Future;

use async_trait::async_trait;

/// Caller-supplied "try the task again" callback.
///
/// Receives the adjusted task input when one is available. Any closure
/// `Fn(Option<String>) -> impl Future<Output = anyhow::Result<Value>>`
/// implements this trait.
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    async fn attempt(&self, adjusted_input: Option<String>) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
impl<F, Fut> RecoveryCallback for F
where
    F: Fn(Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn attempt(&self, adjusted_input: Option<String>) -> anyhow::Result<serde_json::Value> {
        (self)(adjusted_input).await
    }
}
