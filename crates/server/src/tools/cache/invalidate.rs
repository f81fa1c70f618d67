//! cache_invalidate tool implementation.
//!
//! Removes cached query results by key pattern and/or tag.

use kbstore_core::QueryCache;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::tools::json_result;

/// Parameters for the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateParams {
    /// Regular expression matched against cache keys.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Remove entries carrying any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Required to clear everything when neither pattern nor tags is given.
    #[serde(default)]
    pub all: bool,
}

/// Output from the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateOutput {
    /// Number of in-memory entries removed.
    pub removed: usize,
}

/// Implementation of the cache_invalidate tool.
pub async fn invalidate_impl(cache: &QueryCache, params: CacheInvalidateParams) -> Result<CallToolResult, McpError> {
    if params.pattern.is_none() && params.tags.is_empty() && !params.all {
        return Err(ToolError::InvalidInput(
            "At least one of pattern or tags must be specified, or all=true to clear the cache".to_string(),
        )
        .into());
    }

    let removed = cache.invalidate(params.pattern.as_deref(), &params.tags).await?;
    json_result(&CacheInvalidateOutput { removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::output;
    use kbstore_core::CacheOptions;
    use kbstore_core::config::CacheConfig;

    async fn seeded() -> QueryCache {
        let cache = QueryCache::new(CacheConfig::default());
        let tagged = CacheOptions { tags: vec!["notes".into()], ..Default::default() };
        cache.set("notes:recent", &vec![1, 2], tagged).await.unwrap();
        cache.set("notes:all", &vec![1, 2, 3], CacheOptions::default()).await.unwrap();
        cache.set("users:all", &vec![7], CacheOptions::default()).await.unwrap();
        cache
    }

    fn params(pattern: Option<&str>, tags: &[&str], all: bool) -> CacheInvalidateParams {
        CacheInvalidateParams {
            pattern: pattern.map(String::from),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            all,
        }
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = seeded().await;
        let out: CacheInvalidateOutput = output(&invalidate_impl(&cache, params(Some("^notes:"), &[], false)).await.unwrap());
        assert_eq!(out.removed, 2);
        assert!(cache.contains("users:all"));
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = seeded().await;
        let out: CacheInvalidateOutput = output(&invalidate_impl(&cache, params(None, &["notes"], false)).await.unwrap());
        assert_eq!(out.removed, 1);
        assert!(cache.contains("notes:all"));
    }

    #[tokio::test]
    async fn test_clear_requires_all_flag() {
        let cache = seeded().await;
        assert!(invalidate_impl(&cache, params(None, &[], false)).await.is_err());
        assert_eq!(cache.len(), 3);

        let out: CacheInvalidateOutput = output(&invalidate_impl(&cache, params(None, &[], true)).await.unwrap());
        assert_eq!(out.removed, 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_bad_pattern_is_invalid_input() {
        let cache = seeded().await;
        let err = invalidate_impl(&cache, params(Some("("), &[], false)).await.unwrap_err();
        assert_eq!(err.code.0, -32602);
    }
}
