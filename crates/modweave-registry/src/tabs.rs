use async_trait::async_trait;
use serde_json::Value;

/// A browsing context the controller can reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: u64,
    pub origin: String,
}

/// Tab/messaging collaborator: delivering envelopes into content
/// contexts, enumerating tabs, and reversing response interception for
/// an origin.
#[async_trait]
pub trait TabBridge: Send + Sync {
    async fn send_to_tab(&self, tab: u64, envelope: Value) -> anyhow::Result<Value>;
    async fn query_tabs(&self) -> Vec<TabInfo>;
    /// Invalidates the browser cache for one origin, so a freshly
    /// enabled response-modifying mod sees uncached responses.
    async fn clear_origin_cache(&self, origin: &str);
}

/// Bridge for embedders without tabs (and for tests that only watch the
/// registry side).
#[derive(Debug, Default)]
pub struct NullTabBridge;

#[async_trait]
impl TabBridge for NullTabBridge {
    async fn send_to_tab(&self, _tab: u64, _envelope: Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn query_tabs(&self) -> Vec<TabInfo> {
        Vec::new()
    }

    async fn clear_origin_cache(&self, _origin: &str) {}
}
