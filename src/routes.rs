//! Backends, routes, aliases, and alias resolution against a snapshot.

use crate::config::RuntimeConfig;
use crate::cooldown::cooldown_key;
use crate::error::ProxyError;
use crate::protocol::Protocol;
use std::sync::Arc;

/// One upstream provider endpoint. Immutable once constructed; owned by the
/// configuration snapshot that created it.
#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    pub protocol: Protocol,
    pub locale: Option<String>,
}

/// A candidate (backend, provider-model) pair inside an alias.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub backend: String,
    pub model: String,
    pub priority: u32,
    pub enabled: bool,
    pub protocol: Option<Protocol>,
    pub reasoning: bool,
}

/// Public model name with its ordered candidate list.
#[derive(Debug, Clone)]
pub struct ModelAlias {
    pub enabled: bool,
    pub routes: Vec<ModelRoute>,
}

/// Hydrated, per-request route: backend reference resolved and protocol
/// defaulted from the backend.
#[derive(Debug, Clone)]
pub struct Route {
    pub backend: Arc<Backend>,
    pub model: String,
    pub priority: u32,
    pub protocol: Protocol,
    pub reasoning: bool,
}

impl Route {
    pub fn cooldown_key(&self) -> String {
        cooldown_key(&self.backend.name, &self.model)
    }
}

/// Resolve an alias against the given snapshot.
///
/// Fails with a 404-equivalent error when the alias is unknown; yields an
/// empty list when the alias is disabled. Routes that are disabled or whose
/// backend is missing or disabled are silently dropped. Declared order is
/// preserved.
pub fn resolve_alias(config: &RuntimeConfig, alias: &str) -> Result<Vec<Route>, ProxyError> {
    let entry = config.aliases.get(alias).ok_or_else(|| ProxyError::alias_not_found(alias))?;
    if !entry.enabled {
        return Ok(Vec::new());
    }
    let routes = entry
        .routes
        .iter()
        .filter(|route| route.enabled)
        .filter_map(|route| {
            let backend = config.backends.get(&route.backend).filter(|b| b.enabled)?;
            Some(Route {
                backend: Arc::clone(backend),
                model: route.model.clone(),
                priority: route.priority,
                protocol: route.protocol.unwrap_or(backend.protocol),
                reasoning: route.reasoning,
            })
        })
        .collect();
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::ErrorKind;

    fn config(yaml: &str) -> RuntimeConfig {
        Settings::from_yaml(yaml).unwrap().into_runtime().unwrap()
    }

    const BASE: &str = r#"
backends:
  - name: a
    url: http://a.example
  - name: b
    url: http://b.example
    protocol: anthropic
  - name: dark
    url: http://dark.example
    enabled: false
models:
  chat:
    routes:
      - backend: a
        model: a-large
        priority: 1
      - backend: b
        model: b-large
        priority: 2
        protocol: openai
      - backend: dark
        model: dark-large
        priority: 0
      - backend: missing
        model: ghost
      - backend: a
        model: a-small
        priority: 3
        enabled: false
  off:
    enabled: false
    routes:
      - backend: a
        model: a-large
"#;

    #[test]
    fn resolves_ordered_hydrated_routes() {
        let cfg = config(BASE);
        let routes = resolve_alias(&cfg, "chat").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].backend.name, "a");
        assert_eq!(routes[0].model, "a-large");
        assert_eq!(routes[0].protocol, Protocol::OpenAi);
        assert_eq!(routes[1].backend.name, "b");
        // Route-level protocol override wins over the backend's tag.
        assert_eq!(routes[1].protocol, Protocol::OpenAi);
    }

    #[test]
    fn protocol_defaults_from_backend() {
        let cfg = config(
            "backends:\n  - name: b\n    url: http://b\n    protocol: anthropic\nmodels:\n  m:\n    routes:\n      - backend: b\n        model: x\n",
        );
        let routes = resolve_alias(&cfg, "m").unwrap();
        assert_eq!(routes[0].protocol, Protocol::Anthropic);
    }

    #[test]
    fn unknown_alias_is_not_found() {
        let cfg = config(BASE);
        let err = resolve_alias(&cfg, "nope").unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn disabled_alias_resolves_empty() {
        let cfg = config(BASE);
        assert!(resolve_alias(&cfg, "off").unwrap().is_empty());
    }

    #[test]
    fn disabled_and_dangling_routes_are_dropped() {
        let cfg = config(BASE);
        let routes = resolve_alias(&cfg, "chat").unwrap();
        assert!(routes.iter().all(|r| r.backend.name != "dark"));
        assert!(routes.iter().all(|r| r.model != "a-small"));
    }

    #[test]
    fn cooldown_key_is_backend_slash_model() {
        let cfg = config(BASE);
        let routes = resolve_alias(&cfg, "chat").unwrap();
        assert_eq!(routes[0].cooldown_key(), "a/a-large");
    }
}
