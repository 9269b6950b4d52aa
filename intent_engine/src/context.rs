// Request-scoped caller context handed to matching and callbacks.

use crate::rule::Locale;
use serde_json::Value;
use std::collections::HashMap;

/// Everything the engine knows about the caller of one request.
///
/// Identity is nullable (anonymous callers are a normal case), and the
/// `values` map carries request-scoped extras a callback may need, such as
/// a requested timezone.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Caller identity; `None` means anonymous.
    pub identity: Option<String>,
    /// Whether the caller holds the administrative capability.
    pub is_admin: bool,
    /// Locale hint for pattern and response resolution.
    pub locale: Locale,
    /// Optional IANA timezone hint.
    pub timezone: Option<String>,
    /// Other request-scoped values, keyed by name.
    pub values: HashMap<String, Value>,
}

impl CallerContext {
    /// An anonymous caller with the default locale.
    pub fn anonymous() -> Self {
        CallerContext::default()
    }

    /// A non-anonymous caller.
    pub fn authenticated(identity: impl Into<String>) -> Self {
        CallerContext {
            identity: Some(identity.into()),
            ..CallerContext::default()
        }
    }

    /// A caller holding the administrative capability.
    pub fn admin(identity: impl Into<String>) -> Self {
        CallerContext {
            identity: Some(identity.into()),
            is_admin: true,
            ..CallerContext::default()
        }
    }

    pub fn with_locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.is_none()
    }

    /// Looks up a request-scoped value by key.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anonymous_by_default() {
        let ctx = CallerContext::anonymous();
        assert!(ctx.is_anonymous());
        assert!(!ctx.is_admin);
        assert_eq!(ctx.locale, Locale::default_locale());
    }

    #[test]
    fn test_builder_style_setters() {
        let ctx = CallerContext::authenticated("alice")
            .with_locale(Locale::new("pl"))
            .with_timezone("Europe/Warsaw")
            .with_value("units", json!("metric"));

        assert!(!ctx.is_anonymous());
        assert_eq!(ctx.locale.as_str(), "pl");
        assert_eq!(ctx.timezone.as_deref(), Some("Europe/Warsaw"));
        assert_eq!(ctx.value("units"), Some(&json!("metric")));
    }
}
