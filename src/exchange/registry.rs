//! Exchange registry - cached adapters plus connectivity bookkeeping
//!
//! Adapters are built once per name and handed out as `Arc<dyn ExchangeAdapter>`.
//! In paper mode live adapters are wrapped in [`PaperExchange`] so the rest of
//! the bot never needs to know which mode it runs in.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::ExchangesConfig;
use crate::exchange::{build_adapter, Capabilities, ExchangeAdapter, PaperExchange};

/// Connectivity state of one exchange
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    pub name: String,
    pub capabilities: Capabilities,
    /// Result of the last connectivity probe
    pub reachable: bool,
    pub last_checked: Option<DateTime<Utc>>,
    /// Cooldown after repeated transient failures
    pub unreachable_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ExchangeStatus {
    fn new(name: &str, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            reachable: false,
            last_checked: None,
            unreachable_until: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.reachable && self.unreachable_until.map(|until| now >= until).unwrap_or(true)
    }
}

pub struct ExchangeRegistry {
    config: ExchangesConfig,
    paper: bool,
    taker_fee: f64,
    /// Starting quote balance for paper wrappers
    paper_balance: Option<(String, f64)>,
    /// Registration order is preserved
    adapters: RwLock<Vec<(String, Arc<dyn ExchangeAdapter>)>>,
    statuses: RwLock<HashMap<String, ExchangeStatus>>,
}

impl ExchangeRegistry {
    pub fn new(config: &ExchangesConfig, paper: bool) -> Self {
        Self {
            config: config.clone(),
            paper,
            taker_fee: 0.001,
            paper_balance: None,
            adapters: RwLock::new(Vec::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_taker_fee(mut self, fee: f64) -> Self {
        self.taker_fee = fee;
        self
    }

    pub fn with_paper_balance(mut self, currency: &str, amount: f64) -> Self {
        self.paper_balance = Some((currency.to_uppercase(), amount));
        self
    }

    pub fn is_paper(&self) -> bool {
        self.paper
    }

    /// Build adapters for every enabled exchange
    pub fn initialize(&self) {
        for name in &self.config.enabled {
            let adapter = self.create_adapter(name);
            tracing::info!(
                exchange = %adapter.name(),
                paper = adapter.capabilities().paper_mode,
                "Exchange adapter ready"
            );
        }
    }

    /// Cached adapter for `name`, building it on first use
    pub fn create_adapter(&self, name: &str) -> Arc<dyn ExchangeAdapter> {
        let key = name.trim().to_lowercase();
        if let Some(existing) = self.get(&key) {
            return existing;
        }

        let mut adapter = build_adapter(&key, &self.config);
        let caps = adapter.capabilities();
        if self.paper && caps.spot_trading && !caps.paper_mode {
            let mut paper = PaperExchange::new(adapter, self.taker_fee);
            if let Some((currency, amount)) = &self.paper_balance {
                paper = paper.with_balance(currency, *amount);
            }
            adapter = Arc::new(paper);
        }

        self.insert(&key, adapter.clone());
        adapter
    }

    /// Register (or replace) an adapter under `name`
    pub fn insert(&self, name: &str, adapter: Arc<dyn ExchangeAdapter>) {
        let key = name.trim().to_lowercase();
        let capabilities = adapter.capabilities();

        if let Ok(mut adapters) = self.adapters.write() {
            match adapters.iter_mut().find(|(n, _)| *n == key) {
                Some(slot) => slot.1 = adapter,
                None => adapters.push((key.clone(), adapter)),
            }
        }
        if let Ok(mut statuses) = self.statuses.write() {
            statuses
                .entry(key.clone())
                .or_insert_with(|| ExchangeStatus::new(&key, capabilities))
                .capabilities = capabilities;
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        let key = name.trim().to_lowercase();
        self.adapters
            .read()
            .ok()?
            .iter()
            .find(|(n, _)| *n == key)
            .map(|(_, a)| a.clone())
    }

    fn all(&self) -> Vec<(String, Arc<dyn ExchangeAdapter>)> {
        self.adapters.read().map(|a| a.clone()).unwrap_or_default()
    }

    /// Probe every registered adapter concurrently
    pub async fn probe_all(&self) -> Vec<ExchangeStatus> {
        let targets = self.all();
        self.probe(targets).await;
        self.statuses()
    }

    /// Re-probe exchanges that are down and out of cooldown
    pub async fn probe_unreachable(&self) {
        let now = Utc::now();
        let down: Vec<String> = self
            .statuses()
            .into_iter()
            .filter(|s| !s.reachable && s.unreachable_until.map(|u| now >= u).unwrap_or(true))
            .map(|s| s.name)
            .collect();
        if down.is_empty() {
            return;
        }
        let targets = self
            .all()
            .into_iter()
            .filter(|(n, _)| down.contains(n))
            .collect();
        self.probe(targets).await;
    }

    async fn probe(&self, targets: Vec<(String, Arc<dyn ExchangeAdapter>)>) {
        let probes = targets.iter().map(|(name, adapter)| async move {
            let ok = adapter.connect().await;
            (name.clone(), ok)
        });
        let results = join_all(probes).await;

        let now = Utc::now();
        if let Ok(mut statuses) = self.statuses.write() {
            for (name, ok) in results {
                if let Some(status) = statuses.get_mut(&name) {
                    status.reachable = ok;
                    status.last_checked = Some(now);
                    if ok {
                        status.consecutive_failures = 0;
                        status.unreachable_until = None;
                    }
                }
                if ok {
                    tracing::info!(exchange = %name, "Exchange reachable");
                } else {
                    tracing::warn!(exchange = %name, "Exchange unreachable");
                }
            }
        }
    }

    /// Transient failure survived the retry policy: start the cooldown
    pub fn mark_failure(&self, name: &str) {
        let until = Utc::now()
            + chrono::Duration::from_std(self.config.cooldown())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        if let Ok(mut statuses) = self.statuses.write() {
            if let Some(status) = statuses.get_mut(name) {
                status.consecutive_failures += 1;
                status.unreachable_until = Some(until);
                tracing::warn!(
                    exchange = %name,
                    failures = status.consecutive_failures,
                    until = %until,
                    "Exchange in cooldown"
                );
            }
        }
    }

    pub fn mark_success(&self, name: &str) {
        if let Ok(mut statuses) = self.statuses.write() {
            if let Some(status) = statuses.get_mut(name) {
                status.reachable = true;
                status.consecutive_failures = 0;
                status.unreachable_until = None;
            }
        }
    }

    /// Names whose last probe succeeded and whose cooldown has expired
    pub fn list_available(&self) -> Vec<String> {
        let now = Utc::now();
        let statuses = match self.statuses.read() {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        self.all()
            .into_iter()
            .filter(|(name, _)| statuses.get(name).map(|s| s.is_available(now)).unwrap_or(false))
            .map(|(name, _)| name)
            .collect()
    }

    /// Available adapters keyed by registry name
    pub fn available_entries(&self) -> Vec<(String, Arc<dyn ExchangeAdapter>)> {
        let available = self.list_available();
        self.all()
            .into_iter()
            .filter(|(name, _)| available.contains(name))
            .collect()
    }

    /// Statuses in registration order
    pub fn statuses(&self) -> Vec<ExchangeStatus> {
        let statuses = match self.statuses.read() {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        self.all()
            .iter()
            .filter_map(|(name, _)| statuses.get(name).cloned())
            .collect()
    }
}
