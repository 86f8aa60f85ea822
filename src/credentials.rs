/// Credential resolution.
///
/// Bindings carry an opaque credential reference, here the name of an
/// environment variable. Tokens are resolved at the moment of use and are
/// never written to config, state, or logs.
pub trait CredentialResolver: Send + Sync {
    /// Resolve a credential reference to a token, or None if unset
    fn resolve(&self, credential_ref: &str) -> Option<String>;
}

/// Resolves credential references against process environment variables
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, credential_ref: &str) -> Option<String> {
        match std::env::var(credential_ref) {
            Ok(token) if !token.trim().is_empty() => Some(token),
            _ => None,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Fixed-map resolver for tests, avoids touching the real environment
    #[derive(Debug, Default)]
    pub struct StaticCredentials {
        tokens: HashMap<String, String>,
    }

    impl StaticCredentials {
        pub fn with(pairs: &[(&str, &str)]) -> Self {
            Self {
                tokens: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }
    }

    impl CredentialResolver for StaticCredentials {
        fn resolve(&self, credential_ref: &str) -> Option<String> {
            self.tokens.get(credential_ref).cloned()
        }
    }
}
