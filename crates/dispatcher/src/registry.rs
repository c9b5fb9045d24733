use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use relay_core::config::{RouteConfig, RouteModeKind};
use relay_core::{RelayError, RelayResult};

use crate::handler::Handler;

/// 处理器注册表
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under `handler.name()`, replacing any previous handler of that name.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        info!("Registered handler: {}", name);
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// How a route answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMode {
    RequestResponse { reply_topic: String },
    Streaming { event_topic: String },
    FireAndForget,
}

impl RouteMode {
    pub fn label(&self) -> &'static str {
        match self {
            RouteMode::RequestResponse { .. } => "request_response",
            RouteMode::Streaming { .. } => "streaming",
            RouteMode::FireAndForget => "fire_and_forget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub topic: String,
    pub handler: String,
    pub mode: RouteMode,
    /// Name of the circuit breaker guarding the handler, if any
    pub dependency: Option<String>,
}

impl TryFrom<&RouteConfig> for Route {
    type Error = RelayError;

    fn try_from(config: &RouteConfig) -> RelayResult<Self> {
        let reply_topic = || {
            config
                .reply_topic
                .clone()
                .filter(|topic| !topic.is_empty())
                .ok_or_else(|| RelayError::Configuration(format!("route {} needs a reply topic", config.topic)))
        };

        let mode = match config.mode {
            RouteModeKind::RequestResponse => RouteMode::RequestResponse {
                reply_topic: reply_topic()?,
            },
            RouteModeKind::Streaming => RouteMode::Streaming {
                event_topic: reply_topic()?,
            },
            RouteModeKind::FireAndForget => RouteMode::FireAndForget,
        };

        Ok(Route {
            topic: config.topic.clone(),
            handler: config.handler.clone(),
            mode,
            dependency: config.dependency.clone(),
        })
    }
}

/// Static topic → route table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[RouteConfig]) -> RelayResult<Self> {
        let mut table = Self::new();
        for config in routes {
            table.insert(Route::try_from(config)?)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, route: Route) -> RelayResult<()> {
        if self.routes.contains_key(&route.topic) {
            return Err(RelayError::Configuration(format!(
                "topic {} is routed twice",
                route.topic
            )));
        }
        self.routes.insert(route.topic.clone(), route);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Option<&Route> {
        self.routes.get(topic)
    }

    /// Subscribed topics, sorted for stable group membership.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Every route must name a registered handler.
    pub fn check_handlers(&self, registry: &HandlerRegistry) -> RelayResult<()> {
        for route in self.routes.values() {
            if !registry.contains(&route.handler) {
                return Err(RelayError::Configuration(format!(
                    "route {} refers to unknown handler {}",
                    route.topic, route.handler
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
