//! Descriptive content metadata attached to a player session, and the
//! resolver seam that produces it at load time.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde_json::{Map, Value};

use crate::playback::{MediaElement, PlayerBackend};

/// Open property bag describing the content being played. Keys arrive in the
/// host's camelCase convention and are snake-cased on the way into payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(pub Map<String, Value>);

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn src(&self) -> Option<&str> {
        self.0.get("src").and_then(Value::as_str)
    }

    /// URL fallback chain within the metadata itself.
    pub fn src_or_url(&self) -> Option<&str> {
        self.src()
            .or_else(|| self.0.get("url").and_then(Value::as_str))
    }

    pub fn set_src(&mut self, src: &str) {
        self.0.insert("src".into(), Value::String(src.to_string()));
    }

    pub fn duration_sec(&self) -> Option<u64> {
        self.0.get("durationSec").and_then(Value::as_u64)
    }

    pub fn set_duration_sec(&mut self, seconds: u64) {
        self.0.insert("durationSec".into(), Value::from(seconds));
    }

    /// Payload form: every key converted to snake_case.
    pub fn snake_params(&self) -> Map<String, Value> {
        snake_keys(&self.0)
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Analytics properties are snake_case; hosts hand us camelCase.
pub fn camel_to_snake(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower_or_digit = false;
    for ch in input.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else {
            prev_lower_or_digit = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}

pub fn snake_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (camel_to_snake(key), value.clone()))
        .collect()
}

/// Context handed to a metadata resolver at load time.
#[derive(Clone)]
pub struct ResolveContext {
    pub url: String,
    pub player: Option<Arc<dyn PlayerBackend>>,
    pub media: Option<Arc<dyn MediaElement>>,
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, ctx: ResolveContext) -> anyhow::Result<Metadata>;
}

/// Either a static property map or an invokable resolver.
#[derive(Clone)]
pub enum MetadataSource {
    Static(Metadata),
    Resolver(Arc<dyn MetadataResolver>),
}

impl Default for MetadataSource {
    fn default() -> Self {
        Self::Static(Metadata::default())
    }
}

impl MetadataSource {
    /// Resolution never fails: resolver faults degrade to empty metadata.
    pub async fn resolve(&self, ctx: ResolveContext) -> Metadata {
        match self {
            Self::Static(meta) => meta.clone(),
            Self::Resolver(resolver) => match resolver.resolve(ctx).await {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("Metadata resolver failed, continuing with empty metadata: {err}");
                    Metadata::default()
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[test]
    fn camel_to_snake_conversion() {
        assert_eq!(camel_to_snake("durationSec"), "duration_sec");
        assert_eq!(camel_to_snake("contentId"), "content_id");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
        assert_eq!(camel_to_snake("src"), "src");
    }

    #[test]
    fn snake_params_converts_all_keys() {
        let mut map = Map::new();
        map.insert("contentId".into(), json!("abc"));
        map.insert("durationSec".into(), json!(120));
        let meta = Metadata(map);

        let params = meta.snake_params();
        assert_eq!(params["content_id"], json!("abc"));
        assert_eq!(params["duration_sec"], json!(120));
    }

    struct FailingResolver;

    #[async_trait]
    impl MetadataResolver for FailingResolver {
        async fn resolve(&self, _ctx: ResolveContext) -> anyhow::Result<Metadata> {
            Err(anyhow!("catalog lookup failed"))
        }
    }

    #[tokio::test]
    async fn resolver_failure_degrades_to_empty_metadata() {
        let source = MetadataSource::Resolver(Arc::new(FailingResolver));
        let meta = source
            .resolve(ResolveContext {
                url: "http://example.com/a.mpd".into(),
                player: None,
                media: None,
            })
            .await;
        assert!(meta.is_empty());
    }
}
