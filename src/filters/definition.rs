//! Declarative filter definitions.
//!
//! A definition is a small TOML document:
//!
//! ```toml
//! name = "add-trace-header"
//! kind = "set_response_header"
//! phase = "outbound"
//! priority = 10
//! always_run = true
//!
//! [when]
//! path_prefix = "/api"
//! methods = ["GET", "HEAD"]
//!
//! [settings]
//! name = "x-served-by"
//! value = "edge"
//! ```

use serde::Deserialize;

use crate::filters::context::RequestContext;
use crate::filters::unit::Phase;

/// Parsed filter definition, ready to hand to a factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterDefinition {
    /// Filter name. Defaults to the source identity.
    #[serde(default)]
    pub name: Option<String>,

    /// Which registered implementation to instantiate.
    pub kind: String,

    pub phase: Phase,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub always_run: bool,

    #[serde(default)]
    pub critical: bool,

    /// Applicability condition.
    #[serde(default)]
    pub when: Option<Condition>,

    /// Kind-specific settings.
    #[serde(default)]
    pub settings: toml::Table,
}

impl FilterDefinition {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Request predicate attached to a filter. Every present clause must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Condition {
    pub path_prefix: Option<String>,
    /// Accepted methods, case-insensitive. Empty means any.
    pub methods: Vec<String>,
    /// Header that must be present on the request.
    pub header: Option<String>,
}

impl Condition {
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        let request = ctx.request();

        if let Some(prefix) = &self.path_prefix {
            if !request.uri().path().starts_with(prefix.as_str()) {
                return false;
            }
        }

        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(request.method().as_str()))
        {
            return false;
        }

        match &self.header {
            Some(name) => request.headers().contains_key(name.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    #[test]
    fn parses_full_definition() {
        let def = FilterDefinition::parse(
            r#"
            name = "hdr"
            kind = "set_response_header"
            phase = "outbound"
            priority = -5
            always_run = true

            [when]
            methods = ["get"]

            [settings]
            name = "x-a"
            value = "b"
            "#,
        )
        .unwrap();

        assert_eq!(def.name.as_deref(), Some("hdr"));
        assert_eq!(def.phase, Phase::Outbound);
        assert_eq!(def.priority, -5);
        assert!(def.always_run);
        assert!(!def.critical);
        assert_eq!(def.settings["value"].as_str(), Some("b"));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(FilterDefinition::parse("kind = \"x\"\nphase = \"inbound\"\nprioritty = 1").is_err());
    }

    #[test]
    fn condition_clauses_all_apply() {
        let cond = Condition {
            path_prefix: Some("/api".into()),
            methods: vec!["post".into()],
            header: Some("authorization".into()),
        };

        let matching = Request::post("/api/x")
            .header("authorization", "token")
            .body(Body::empty())
            .unwrap();
        assert!(cond.matches(&RequestContext::new(matching)));

        let wrong_method = Request::get("/api/x")
            .header("authorization", "token")
            .body(Body::empty())
            .unwrap();
        assert!(!cond.matches(&RequestContext::new(wrong_method)));

        let no_header = Request::post("/api/x").body(Body::empty()).unwrap();
        assert!(!cond.matches(&RequestContext::new(no_header)));
    }
}
