use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Names an operation: the capability a provider offers, the selector of
/// the operation within it, and optionally a specific provider instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Capability (service type) the provider must offer.
    pub capability: String,
    /// Operation within the capability.
    pub selector: String,
    /// Restrict dispatch to a single named provider.
    pub provider: Option<String>,
    /// Context path receiving the operation's scalar result. Falls back to
    /// the context's own return path.
    pub return_path: Option<String>,
}

impl Signature {
    pub fn new(capability: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            selector: selector.into(),
            provider: None,
            return_path: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_return_path(mut self, path: impl Into<String>) -> Self {
        self.return_path = Some(path.into());
        self
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.capability, self.selector)?;
        if let Some(provider) = &self.provider {
            write!(f, "@{provider}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_provider_when_named() {
        let sig = Signature::new("Arithmetic", "add");
        assert_eq!(sig.to_string(), "Arithmetic#add");

        let sig = sig.with_provider("adder-1").with_return_path("result/y");
        assert_eq!(sig.to_string(), "Arithmetic#add@adder-1");
        assert_eq!(sig.return_path.as_deref(), Some("result/y"));
    }
}
