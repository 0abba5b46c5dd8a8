//! Provider selection keyed by [`ProviderKind`].
//!
//! The factory holds one constructor per provider. Only the `command`
//! provider is registered out of the box; embedding applications register
//! HTTP providers with [`LlmClientFactory::register`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pipeline::{LlmClient, LlmError, ProviderKind, ResolvedClient};
use tracing::debug;

use crate::command::CommandClient;

/// Builds a client for a resolved stage configuration.
pub trait ClientConstructor: Send + Sync {
    /// Creates the client. `api_key` holds the resolved credential, if one is configured.
    fn construct(
        &self,
        client: &ResolvedClient,
        api_key: Option<String>,
    ) -> Result<Arc<dyn LlmClient>, LlmError>;
}

impl<F> ClientConstructor for F
where
    F: Fn(&ResolvedClient, Option<String>) -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync,
{
    fn construct(
        &self,
        client: &ResolvedClient,
        api_key: Option<String>,
    ) -> Result<Arc<dyn LlmClient>, LlmError> {
        self(client, api_key)
    }
}

fn construct_command(
    client: &ResolvedClient,
    api_key: Option<String>,
) -> Result<Arc<dyn LlmClient>, LlmError> {
    Ok(Arc::new(CommandClient::from_resolved(client, api_key)?))
}

type CredentialSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Maps providers to constructors and resolves credentials.
#[derive(Clone)]
pub struct LlmClientFactory {
    constructors: HashMap<ProviderKind, Arc<dyn ClientConstructor>>,
    credentials: CredentialSource,
}

impl fmt::Debug for LlmClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.constructors.keys().collect();
        providers.sort();
        f.debug_struct("LlmClientFactory")
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}

impl Default for LlmClientFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl LlmClientFactory {
    /// A factory with no registered providers that reads credentials from the environment.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            credentials: Arc::new(|name: &str| std::env::var(name).ok().filter(|v| !v.is_empty())),
        }
    }

    /// A factory with the built-in `command` provider registered.
    pub fn with_builtin() -> Self {
        Self::new().register(ProviderKind::Command, construct_command)
    }

    /// Registers (or replaces) the constructor for `provider`.
    pub fn register(mut self, provider: ProviderKind, constructor: impl ClientConstructor + 'static) -> Self {
        self.constructors.insert(provider, Arc::new(constructor));
        self
    }

    /// Replaces how credential names are resolved to secrets.
    pub fn with_credential_source(
        mut self,
        source: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.credentials = Arc::new(source);
        self
    }

    /// Whether `provider` has a constructor.
    pub fn supports(&self, provider: ProviderKind) -> bool {
        self.constructors.contains_key(&provider)
    }

    /// Builds the client for one stage.
    ///
    /// Fails with [`LlmError::Misconfiguration`] for an unregistered provider
    /// and [`LlmError::Authentication`] when the configured credential is unset.
    pub fn build(&self, client: &ResolvedClient) -> Result<Arc<dyn LlmClient>, LlmError> {
        let constructor = self.constructors.get(&client.provider).ok_or_else(|| {
            LlmError::Misconfiguration(format!(
                "no client registered for provider '{}' (stage {})",
                client.provider, client.stage
            ))
        })?;

        let api_key = match client.credential.as_deref() {
            Some(name) => Some((self.credentials)(name).ok_or_else(|| {
                LlmError::Authentication(format!(
                    "credential environment variable '{name}' is not set (stage {})",
                    client.stage
                ))
            })?),
            None => None,
        };

        debug!(
            stage = %client.stage,
            provider = %client.provider,
            model = %client.model,
            "Building LLM client"
        );
        constructor.construct(client, api_key)
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{PipelineConfig, Stage};

    use super::*;
    use crate::scripted::ScriptedClient;

    fn resolved(provider: ProviderKind, credential: Option<&str>) -> ResolvedClient {
        let mut client = PipelineConfig::default().resolve_client(Stage::Design);
        client.provider = provider;
        client.credential = credential.map(str::to_string);
        client
    }

    fn scripted_constructor(
        _client: &ResolvedClient,
        api_key: Option<String>,
    ) -> Result<Arc<dyn LlmClient>, LlmError> {
        assert_eq!(api_key.as_deref(), Some("sk-test"));
        Ok(Arc::new(ScriptedClient::new()))
    }

    #[test]
    fn unregistered_provider_is_misconfiguration() {
        let factory = LlmClientFactory::with_builtin();
        let err = factory.build(&resolved(ProviderKind::Anthropic, None)).err().expect("expected error");
        assert!(matches!(err, LlmError::Misconfiguration(_)));
        assert_eq!(err.kind(), pipeline::ErrorKind::Fatal);
    }

    #[test]
    fn missing_credential_is_authentication_error() {
        let factory = LlmClientFactory::new()
            .register(ProviderKind::Anthropic, scripted_constructor)
            .with_credential_source(|_| None);
        let err = factory
            .build(&resolved(ProviderKind::Anthropic, Some("ANTHROPIC_API_KEY")))
            .err().expect("expected error");
        assert!(matches!(err, LlmError::Authentication(ref m) if m.contains("ANTHROPIC_API_KEY")));
    }

    #[test]
    fn registered_provider_receives_credential() {
        let factory = LlmClientFactory::new()
            .register(ProviderKind::Anthropic, scripted_constructor)
            .with_credential_source(|name| (name == "KEY").then(|| "sk-test".to_string()));
        let client = factory.build(&resolved(ProviderKind::Anthropic, Some("KEY"))).unwrap();
        assert_eq!(client.name(), "scripted");
    }

    #[test]
    fn builtin_registers_command_only() {
        let factory = LlmClientFactory::with_builtin();
        assert!(factory.supports(ProviderKind::Command));
        assert!(!factory.supports(ProviderKind::OpenAi));
        let client = factory.build(&resolved(ProviderKind::Command, None)).unwrap();
        assert_eq!(client.name(), "command");
    }
}
