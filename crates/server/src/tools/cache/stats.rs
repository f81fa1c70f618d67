//! cache_stats tool implementation.

use kbstore_core::{CacheStats, QueryCache};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the cache_stats tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheStatsParams {
    /// Also count rows in the persisted tier.
    #[serde(default)]
    pub include_persisted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsOutput {
    #[serde(flatten)]
    pub stats: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_entries: Option<usize>,
}

/// Implementation of the cache_stats tool.
pub async fn stats_impl(cache: &QueryCache, params: CacheStatsParams) -> Result<CallToolResult, McpError> {
    let persisted_entries = if params.include_persisted { cache.persisted_len().await } else { None };
    json_result(&CacheStatsOutput { stats: cache.stats(), persisted_entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::output;
    use kbstore_core::CacheOptions;
    use kbstore_core::config::CacheConfig;
    use serde_json::Value as JsonValue;

    #[tokio::test]
    async fn test_stats_report_hits_and_misses() {
        let cache = QueryCache::new(CacheConfig::default());
        let compute = || async { Ok::<_, kbstore_core::Error>(42) };
        cache.get("answer", compute, CacheOptions::default()).await.unwrap();
        cache.get("answer", compute, CacheOptions::default()).await.unwrap();

        let out: JsonValue = output(&stats_impl(&cache, CacheStatsParams::default()).await.unwrap());
        assert_eq!(out["entries"], 1);
        assert_eq!(out["hits"], 1);
        assert_eq!(out["misses"], 1);
        assert_eq!(out["hit_ratio"], 0.5);
        assert!(out.get("persisted_entries").is_none());
    }

    #[tokio::test]
    async fn test_memory_only_cache_has_no_persisted_count() {
        let cache = QueryCache::new(CacheConfig::default());
        let params = CacheStatsParams { include_persisted: true };
        let out: JsonValue = output(&stats_impl(&cache, params).await.unwrap());
        assert!(out.get("persisted_entries").is_none());
        assert_eq!(out["persisted"], false);
    }
}
