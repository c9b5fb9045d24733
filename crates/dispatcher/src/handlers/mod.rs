pub mod http_forward;
pub mod sse;
pub mod validation;

pub use http_forward::HttpForwardHandler;
pub use sse::SseTextDecoder;
pub use validation::RequiredFields;

use std::collections::BTreeMap;
use std::sync::Arc;

use relay_core::config::HandlerConfig;
use relay_core::RelayResult;

use crate::registry::HandlerRegistry;

/// Builds one forwarding handler per configured entry, sharing one HTTP client.
pub fn build_http_handlers(configs: &BTreeMap<String, HandlerConfig>) -> RelayResult<HandlerRegistry> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| relay_core::RelayError::Configuration(format!("创建HTTP客户端失败: {e}")))?;

    let mut registry = HandlerRegistry::new();
    for (name, config) in configs {
        registry.register(Arc::new(HttpForwardHandler::with_client(name, config, client.clone())));
    }
    Ok(registry)
}
