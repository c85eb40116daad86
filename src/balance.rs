//! Balance fetching
//!
//! `BalanceSource` implementations plus the per-adapter cache that absorbs
//! fetch failures into last-known stale values, so a transient RPC failure
//! never propagates past an adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::provider::types::{Address, BalanceSet, TokenBalance};

/// SPL token program owner used for token account lookups
const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

/// Source of balances for one address
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch(&self, address: &Address) -> Result<BalanceSet>;
}

/// JSON-RPC balance source
pub struct RpcBalanceSource {
    config: RpcConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ValueWrap<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    account: AccountData,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    data: ParsedData,
}

#[derive(Debug, Deserialize)]
struct ParsedData {
    parsed: ParsedInfo,
}

#[derive(Debug, Deserialize)]
struct ParsedInfo {
    info: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    mint: String,
    #[serde(rename = "tokenAmount")]
    token_amount: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct TokenAmount {
    amount: String,
    decimals: u8,
}

impl RpcBalanceSource {
    pub fn new(config: RpcConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    async fn rpc_call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RpcTimeout(self.config.timeout_ms)
                } else {
                    Error::Rpc(e.to_string())
                }
            })?;

        let response: RpcResponse<T> = resp.json().await?;

        if let Some(err) = response.error {
            return Err(Error::Rpc(format!("{} ({})", err.message, err.code)));
        }

        response
            .result
            .ok_or_else(|| Error::Rpc(format!("{} returned no result", method)))
    }

    async fn fetch_native(&self, address: &Address) -> Result<u64> {
        let wrap: ValueWrap<u64> = self
            .rpc_call("getBalance", serde_json::json!([address.as_str()]))
            .await?;
        Ok(wrap.value)
    }

    async fn fetch_tokens(&self, address: &Address) -> Result<Vec<TokenBalance>> {
        let params = serde_json::json!([
            address.as_str(),
            { "programId": TOKEN_PROGRAM_ID },
            { "encoding": "jsonParsed" },
        ]);

        let wrap: ValueWrap<Vec<TokenAccount>> =
            self.rpc_call("getTokenAccountsByOwner", params).await?;

        let tokens = wrap
            .value
            .into_iter()
            .filter_map(|account| {
                let info = account.account.data.parsed.info;
                let amount = info.token_amount.amount.parse::<u64>().ok()?;
                Some(TokenBalance {
                    mint: info.mint,
                    symbol: None,
                    amount,
                    decimals: info.token_amount.decimals,
                })
            })
            .collect();

        Ok(tokens)
    }

    async fn fetch_internal(&self, address: &Address) -> Result<BalanceSet> {
        let native_lamports = self.fetch_native(address).await?;
        let tokens = self.fetch_tokens(address).await?;

        debug!(
            "Fetched balances for {}: {} lamports, {} token account(s)",
            address.short(),
            native_lamports,
            tokens.len()
        );

        Ok(BalanceSet {
            native_lamports,
            tokens,
            stale: false,
            fetched_at: Some(Utc::now()),
        })
    }
}

#[async_trait]
impl BalanceSource for RpcBalanceSource {
    async fn fetch(&self, address: &Address) -> Result<BalanceSet> {
        // Transient RPC failures retry with exponential backoff
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(self.config.max_retries as u64 * 2)),
            ..Default::default()
        };

        retry(backoff, || async {
            match self.fetch_internal(address).await {
                Ok(set) => Ok(set),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable balance fetch error: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

/// Fixed-value source for the demo command and tests
pub struct StaticBalanceSource {
    balances: RwLock<BalanceSet>,
    failing: AtomicBool,
}

impl StaticBalanceSource {
    pub fn new(balances: BalanceSet) -> Self {
        Self {
            balances: RwLock::new(balances),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_balances(&self, balances: BalanceSet) {
        *self
            .balances
            .write()
            .unwrap_or_else(PoisonError::into_inner) = balances;
    }

    /// Make every subsequent fetch fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for StaticBalanceSource {
    fn default() -> Self {
        Self::new(BalanceSet::default())
    }
}

#[async_trait]
impl BalanceSource for StaticBalanceSource {
    async fn fetch(&self, _address: &Address) -> Result<BalanceSet> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Rpc("simulated balance failure".to_string()));
        }
        Ok(self
            .balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Last-known balances for one adapter
///
/// Fetch failures degrade to the cached values with the stale flag set
/// instead of surfacing an error.
#[derive(Default)]
pub struct BalanceCache {
    last: RwLock<BalanceSet>,
}

impl BalanceCache {
    /// Current cached values without fetching
    pub fn last(&self) -> BalanceSet {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch through the source, updating the cache on success and
    /// degrading to stale cached values on failure
    pub async fn fetch_through(&self, source: &dyn BalanceSource, address: &Address) -> BalanceSet {
        match source.fetch(address).await {
            Ok(mut set) => {
                set.stale = false;
                if set.fetched_at.is_none() {
                    set.fetched_at = Some(Utc::now());
                }
                *self.last.write().unwrap_or_else(PoisonError::into_inner) = set.clone();
                set
            }
            Err(e) => {
                warn!(
                    "Balance fetch failed for {}, serving stale values: {}",
                    address.short(),
                    e
                );
                let mut guard = self.last.write().unwrap_or_else(PoisonError::into_inner);
                guard.stale = true;
                guard.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> Address {
        Address::new("4Nd1mYvH6PzVZQKVXJMXGyCkkJZf2u1Vi2B86Wk71u2b").unwrap()
    }

    #[tokio::test]
    async fn test_static_source_returns_values() {
        let source = StaticBalanceSource::new(BalanceSet {
            native_lamports: 5_000_000_000,
            ..Default::default()
        });

        let set = source.fetch(&test_address()).await.unwrap();
        assert_eq!(set.native_lamports, 5_000_000_000);
    }

    #[tokio::test]
    async fn test_cache_absorbs_failure_into_stale() {
        let source = StaticBalanceSource::new(BalanceSet {
            native_lamports: 1_000,
            ..Default::default()
        });
        let cache = BalanceCache::default();

        let fresh = cache.fetch_through(&source, &test_address()).await;
        assert!(!fresh.stale);
        assert_eq!(fresh.native_lamports, 1_000);

        source.set_failing(true);
        let stale = cache.fetch_through(&source, &test_address()).await;
        assert!(stale.stale);
        assert_eq!(stale.native_lamports, 1_000);
    }

    #[tokio::test]
    async fn test_cache_recovers_after_failure() {
        let source = StaticBalanceSource::new(BalanceSet {
            native_lamports: 42,
            ..Default::default()
        });
        let cache = BalanceCache::default();

        source.set_failing(true);
        let stale = cache.fetch_through(&source, &test_address()).await;
        assert!(stale.stale);
        assert_eq!(stale.native_lamports, 0);

        source.set_failing(false);
        let fresh = cache.fetch_through(&source, &test_address()).await;
        assert!(!fresh.stale);
        assert_eq!(fresh.native_lamports, 42);
    }

    #[test]
    fn test_rpc_balance_response_parsing() {
        let json = r#"{"jsonrpc":"2.0","result":{"context":{"slot":1},"value":2039280},"id":1}"#;
        let response: RpcResponse<ValueWrap<u64>> = serde_json::from_str(json).unwrap();
        assert_eq!(response.result.unwrap().value, 2039280);
    }

    #[test]
    fn test_rpc_error_response_parsing() {
        let json = r#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"node is behind"},"id":1}"#;
        let response: RpcResponse<ValueWrap<u64>> = serde_json::from_str(json).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32005);
    }

    #[test]
    fn test_token_account_parsing() {
        let json = r#"{
            "account": {
                "data": {
                    "parsed": {
                        "info": {
                            "mint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                            "tokenAmount": {"amount": "123456", "decimals": 6, "uiAmount": 0.123456}
                        }
                    }
                }
            }
        }"#;
        let account: TokenAccount = serde_json::from_str(json).unwrap();
        assert_eq!(
            account.account.data.parsed.info.mint,
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
        );
        assert_eq!(account.account.data.parsed.info.token_amount.decimals, 6);
    }
}
