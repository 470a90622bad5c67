use super::PaymentProvider;
use crate::errors::StoreResult;
use crate::models::{PaymentMethod, ProviderConfig};
use crate::repository::ProviderConfigSource;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Priority for providers without a configuration row.
pub const DEFAULT_PRIORITY: i32 = 100;

/// A provider that is currently usable, with its configured limits
#[derive(Clone)]
pub struct ResolvedProvider {
    pub provider: Arc<dyn PaymentProvider>,
    pub priority: i32,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
}

impl ResolvedProvider {
    pub fn name(&self) -> &str {
        self.provider.name()
    }

    /// Checks `amount` against the configured min/max.
    pub fn amount_in_range(&self, amount: Decimal) -> bool {
        self.min_amount.map_or(true, |min| amount >= min)
            && self.max_amount.map_or(true, |max| amount <= max)
    }
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("name", &self.provider.name())
            .field("priority", &self.priority)
            .field("min_amount", &self.min_amount)
            .field("max_amount", &self.max_amount)
            .finish()
    }
}

/// Lookup table of the providers registered at startup
///
/// Enabled flags and priorities come from the configuration source on every
/// call, so admin changes apply without a restart. Equal priorities keep
/// registration order.
#[derive(Clone)]
pub struct ProviderFactory {
    providers: Vec<Arc<dyn PaymentProvider>>,
    configs: Arc<dyn ProviderConfigSource>,
}

impl ProviderFactory {
    pub fn new(configs: Arc<dyn ProviderConfigSource>) -> Self {
        Self {
            providers: Vec::new(),
            configs,
        }
    }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Any registered provider by name, enabled or not.
    ///
    /// Webhooks for transactions created before a provider was disabled must
    /// still resolve.
    pub fn provider(&self, name: &str) -> Option<Arc<dyn PaymentProvider>> {
        self.providers
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Enabled providers, most preferred first.
    pub async fn active_providers(&self) -> StoreResult<Vec<ResolvedProvider>> {
        let configs = self.configs.provider_configs().await?;
        let mut active: Vec<ResolvedProvider> = self
            .providers
            .iter()
            .filter_map(|provider| resolve(provider, &configs))
            .collect();
        // Stable: ties keep registration order.
        active.sort_by_key(|p| p.priority);
        Ok(active)
    }

    pub async fn providers_for_method(&self, method: PaymentMethod) -> StoreResult<Vec<ResolvedProvider>> {
        Ok(self
            .active_providers()
            .await?
            .into_iter()
            .filter(|p| p.provider.supports_method(method))
            .collect())
    }

    pub async fn provider_for_method(&self, method: PaymentMethod) -> StoreResult<Option<ResolvedProvider>> {
        Ok(self.providers_for_method(method).await?.into_iter().next())
    }

    pub async fn has_provider_for_method(&self, method: PaymentMethod) -> StoreResult<bool> {
        Ok(self.provider_for_method(method).await?.is_some())
    }
}

fn resolve(provider: &Arc<dyn PaymentProvider>, configs: &[ProviderConfig]) -> Option<ResolvedProvider> {
    if !provider.is_enabled() {
        return None;
    }
    match configs
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(provider.name()))
    {
        Some(config) if !config.is_enabled => None,
        Some(config) => Some(ResolvedProvider {
            provider: provider.clone(),
            priority: config.priority,
            min_amount: config.min_amount,
            max_amount: config.max_amount,
        }),
        None => Some(ResolvedProvider {
            provider: provider.clone(),
            priority: DEFAULT_PRIORITY,
            min_amount: None,
            max_amount: None,
        }),
    }
}
