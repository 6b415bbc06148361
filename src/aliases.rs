/// Aliases are the model names clients ask for. Each one resolves to a set of routing parameters:
/// the provider model id to send to the completion engine, the credential to use and any
/// timeout/retry/sampling defaults. They're read from a config file (JSON) and, when the file
/// changes, the whole set is rebuilt and swapped in at once.
///
/// Requests naming an alias that isn't configured are not rejected here: the dispatcher passes
/// the raw name through and lets the engine try to resolve it.
use crate::pricing::PriceTable;
use crate::provider::infer_provider;
use anyhow::anyhow;
use async_trait::async_trait;
use bon::Builder;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

const ENV_PREFIX: &str = "os.environ/";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("api key must be in format 'os.environ/VAR_NAME', got: {0}")]
    InvalidCredentialRef(String),
    #[error("timeout must be positive, got: {0}")]
    InvalidTimeout(u64),
    #[error("model must not be empty")]
    EmptyModel,
    #[error("malformed entry: {0}")]
    Malformed(String),
}

/// Where to find a secret. Only resolved when a request is dispatched, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CredentialRef {
    var: String,
}

impl CredentialRef {
    pub fn env(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var_name(&self) -> &str {
        &self.var
    }

    /// Read the secret from the environment. Unset or empty variables resolve to `None`.
    pub fn resolve(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|v| !v.is_empty())
    }
}

impl TryFrom<String> for CredentialRef {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.strip_prefix(ENV_PREFIX) {
            Some(var) if !var.is_empty() => Ok(Self::env(var)),
            _ => Err(ConfigError::InvalidCredentialRef(value)),
        }
    }
}

impl From<CredentialRef> for String {
    fn from(value: CredentialRef) -> Self {
        format!("{ENV_PREFIX}{}", value.var)
    }
}

/// The resolved configuration for one alias. Immutable once built.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct RoutingParams {
    #[builder(into)]
    pub model_alias: String,
    #[builder(into)]
    pub provider_model_id: String,
    pub credential_ref: CredentialRef,
    pub api_base: Option<Url>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    /// Any other engine parameters, applied with config-default precedence.
    #[builder(default)]
    pub extra: Map<String, Value>,
}

impl RoutingParams {
    pub fn provider(&self) -> String {
        infer_provider(&self.provider_model_id)
    }
}

/// One alias as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AliasEntry {
    pub(crate) model: String,
    pub(crate) api_key: String,
    #[serde(default)]
    pub(crate) api_base: Option<Url>,
    #[serde(default)]
    pub(crate) timeout: Option<u64>,
    #[serde(default)]
    pub(crate) num_retries: Option<u32>,
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) max_tokens: Option<u64>,
    #[serde(default)]
    pub(crate) top_p: Option<f64>,
    #[serde(flatten)]
    pub(crate) extra: Map<String, Value>,
}

impl AliasEntry {
    fn parse(alias: &str, raw: Value) -> Result<RoutingParams, ConfigError> {
        let entry: AliasEntry =
            serde_json::from_value(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        entry.into_routing_params(alias)
    }

    fn into_routing_params(self, alias: &str) -> Result<RoutingParams, ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        let credential_ref = CredentialRef::try_from(self.api_key)?;
        if let Some(0) = self.timeout {
            return Err(ConfigError::InvalidTimeout(0));
        }
        if std::env::var(credential_ref.var_name()).is_err() {
            warn!(
                alias = %alias,
                "Environment variable {} not set, requests using this alias will fail with an authentication error",
                credential_ref.var_name()
            );
        }

        Ok(RoutingParams {
            model_alias: alias.to_string(),
            provider_model_id: self.model,
            credential_ref,
            api_base: self.api_base,
            timeout_seconds: self.timeout,
            max_retries: self.num_retries,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            extra: self.extra,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ProviderEntry {
    pub(crate) url: Url,
}

/// The config file: aliases, provider base URLs and the price table.
///
/// Alias entries stay raw here so one malformed entry is skipped on its own instead of failing
/// the whole file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub(crate) aliases: HashMap<String, Value>,
    #[serde(default)]
    pub(crate) providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub(crate) prices: PriceTable,
}

/// A fully-formed, immutable view of the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    routes: HashMap<String, Arc<RoutingParams>>,
    providers: HashMap<String, Url>,
    prices: PriceTable,
}

impl ConfigSnapshot {
    pub fn new(
        routes: impl IntoIterator<Item = RoutingParams>,
        providers: HashMap<String, Url>,
        prices: PriceTable,
    ) -> Self {
        let routes = routes
            .into_iter()
            .map(|params| (params.model_alias.clone(), Arc::new(params)))
            .collect();
        Self {
            routes,
            providers,
            prices,
        }
    }

    pub async fn from_config_file(config_path: &PathBuf) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let config_file: ConfigFile = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let snapshot = Self::from_config(config_file);
        info!(
            "Loaded {} aliases and {} prices from {}",
            snapshot.routes.len(),
            snapshot.prices.len(),
            config_path.display()
        );
        Ok(snapshot)
    }

    /// Build a snapshot, skipping (and logging) alias entries that fail validation.
    pub(crate) fn from_config(config_file: ConfigFile) -> Self {
        let mut routes = Vec::with_capacity(config_file.aliases.len());
        for (alias, entry) in config_file.aliases {
            match AliasEntry::parse(&alias, entry) {
                Ok(params) => {
                    debug!(
                        alias = %alias,
                        model = %params.provider_model_id,
                        "Alias configured"
                    );
                    routes.push(params);
                }
                Err(e) => warn!(alias = %alias, "Skipping invalid alias: {}", e),
            }
        }
        if routes.is_empty() {
            warn!("No valid aliases configured, all requests will be passed through");
        }

        let providers = config_file
            .providers
            .into_iter()
            .map(|(name, entry)| (name, entry.url))
            .collect();

        Self::new(routes, providers, config_file.prices)
    }

    pub fn resolve(&self, alias: &str) -> Option<Arc<RoutingParams>> {
        self.routes.get(alias).cloned()
    }

    /// Base URL configured for a provider, if any.
    pub fn provider_url(&self, provider: &str) -> Option<&Url> {
        self.providers.get(provider)
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// All aliases, sorted by name.
    pub fn routes(&self) -> Vec<Arc<RoutingParams>> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.model_alias.cmp(&b.model_alias));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The live configuration. Readers take a whole snapshot; reloads replace it wholesale.
#[derive(Debug, Clone, Default)]
pub struct Aliases {
    current: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl Aliases {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, snapshot: ConfigSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    pub fn resolve(&self, alias: &str) -> Option<Arc<RoutingParams>> {
        self.snapshot().resolve(alias)
    }

    /// Receives snapshots from a stream and swaps each one in as it arrives.
    pub async fn receive_updates<W: SnapshotStream + Send + 'static>(
        &self,
        snapshot_stream: W,
    ) -> Result<(), anyhow::Error> {
        let aliases = self.clone();
        let mut rx = snapshot_stream.receive().await?;

        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(snapshot) => {
                        info!("Replacing alias configuration ({} aliases)", snapshot.len());
                        aliases.replace(snapshot);
                    }
                    Err(e) => {
                        error!("Failed to reload config, keeping previous aliases: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
pub trait SnapshotStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ConfigSnapshot, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl SnapshotStream for WatchedFile {
    /// Watches the config file and sends a freshly-built snapshot on every modification.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ConfigSnapshot, anyhow::Error>>, anyhow::Error> {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
        let (file_tx, mut file_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        tokio::spawn(async move {
            // The watcher stops when dropped, so it lives as long as this task.
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!("Config file changed, reloading aliases...");
                        ConfigSnapshot::from_config_file(&config_path).await
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {}", e)),
                };
                if snapshot_tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        Ok(snapshot_rx)
    }
}
