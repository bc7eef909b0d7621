//! Price adapter seam.
//!
//! An adapter is polymorphic over a single capability: given no arguments,
//! produce an [`AdapterRecord`] or fail. Concrete market integrations live
//! outside the core; this module carries the trait, a generic REST adapter
//! for JSON price endpoints, and a fixed adapter for mock-ledger floras
//! and tests.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use flora_common::canonical::number_value;
use flora_common::AdapterRecord;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {adapter_id}: network error: {reason}")]
    Network { adapter_id: String, reason: String },
    #[error("adapter {adapter_id}: unexpected status {status}")]
    Status { adapter_id: String, status: u16 },
    #[error("adapter {adapter_id}: malformed response: {reason}")]
    Malformed { adapter_id: String, reason: String },
    #[error("adapter {adapter_id}: price is not finite")]
    NonFinitePrice { adapter_id: String },
    #[error("adapter {adapter_id}: deadline exceeded")]
    Deadline { adapter_id: String },
}

impl AdapterError {
    pub fn adapter_id(&self) -> &str {
        match self {
            Self::Network { adapter_id, .. }
            | Self::Status { adapter_id, .. }
            | Self::Malformed { adapter_id, .. }
            | Self::NonFinitePrice { adapter_id }
            | Self::Deadline { adapter_id } => adapter_id,
        }
    }
}

/// One registered price source.
#[async_trait]
pub trait PriceAdapter: Send + Sync {
    /// Registry identifier, unique within the flora.
    fn id(&self) -> &str;

    /// Produce one record. The scheduler re-stamps the timestamp with the
    /// epoch timestamp before hashing, so the value set here is a
    /// placeholder.
    async fn fetch(&self) -> Result<AdapterRecord, AdapterError>;
}

/// Build a record from an observed price. Non-finite prices are coerced by
/// the canonicalizer's number rule before fingerprinting.
pub fn build_record(adapter_id: &str, entity_id: &str, source: &str, price: f64) -> AdapterRecord {
    let mut payload = serde_json::Map::new();
    payload.insert("price".to_string(), number_value(price));
    payload.insert("source".to_string(), Value::String(source.to_string()));
    let mut record = AdapterRecord {
        adapter_id: adapter_id.to_string(),
        entity_id: entity_id.to_string(),
        payload,
        timestamp: String::new(),
        source_fingerprint: String::new(),
    };
    record.source_fingerprint = record.compute_fingerprint();
    record
}

// ════════════════════════════════════════════════════════════════════════════
// FIXED ADAPTER
// ════════════════════════════════════════════════════════════════════════════

/// Always reports the same price. Mock-ledger floras and tests.
pub struct FixedAdapter {
    id: String,
    entity_id: String,
    source: String,
    price: f64,
}

impl FixedAdapter {
    pub fn new(id: &str, entity_id: &str, source: &str, price: f64) -> Self {
        Self {
            id: id.to_string(),
            entity_id: entity_id.to_string(),
            source: source.to_string(),
            price,
        }
    }
}

#[async_trait]
impl PriceAdapter for FixedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<AdapterRecord, AdapterError> {
        if !self.price.is_finite() {
            return Err(AdapterError::NonFinitePrice { adapter_id: self.id.clone() });
        }
        Ok(build_record(&self.id, &self.entity_id, &self.source, self.price))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REST ADAPTER
// ════════════════════════════════════════════════════════════════════════════

/// Generic adapter for JSON price endpoints: GET `url`, extract the price
/// at `price_pointer` (a JSON pointer, e.g. `/price` or `/data/rates/USD`).
pub struct RestAdapter {
    id: String,
    entity_id: String,
    source: String,
    url: String,
    price_pointer: String,
    client: reqwest::Client,
}

impl RestAdapter {
    pub fn new(
        id: &str,
        entity_id: &str,
        source: &str,
        url: &str,
        price_pointer: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.to_string(),
            entity_id: entity_id.to_string(),
            source: source.to_string(),
            url: url.to_string(),
            price_pointer: price_pointer.to_string(),
            client,
        }
    }
}

#[async_trait]
impl PriceAdapter for RestAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<AdapterRecord, AdapterError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            AdapterError::Network { adapter_id: self.id.clone(), reason: e.to_string() }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Status { adapter_id: self.id.clone(), status: status.as_u16() });
        }
        let body: Value = response.json().await.map_err(|e| {
            AdapterError::Malformed { adapter_id: self.id.clone(), reason: e.to_string() }
        })?;
        let price = body
            .pointer(&self.price_pointer)
            .and_then(Value::as_f64)
            .ok_or_else(|| AdapterError::Malformed {
                adapter_id: self.id.clone(),
                reason: format!("no number at {}", self.price_pointer),
            })?;
        if !price.is_finite() {
            return Err(AdapterError::NonFinitePrice { adapter_id: self.id.clone() });
        }
        Ok(build_record(&self.id, &self.entity_id, &self.source, price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_adapter_builds_fingerprinted_record() {
        let adapter = FixedAdapter::new("binance", "HBAR-USD", "binance", 0.07);
        let record = adapter.fetch().await.expect("fetch");
        assert_eq!(record.adapter_id, "binance");
        assert_eq!(record.price(), Some(0.07));
        assert_eq!(record.source(), Some("binance"));
        assert_eq!(record.source_fingerprint, record.compute_fingerprint());
        assert_eq!(record.source_fingerprint.len(), 96);
    }

    #[tokio::test]
    async fn identical_payloads_share_a_fingerprint() {
        let a = FixedAdapter::new("binance", "HBAR-USD", "binance", 0.07);
        let b = FixedAdapter::new("binance", "HBAR-USD", "binance", 0.07);
        let ra = a.fetch().await.expect("fetch");
        let rb = b.fetch().await.expect("fetch");
        assert_eq!(ra.source_fingerprint, rb.source_fingerprint);
    }

    #[tokio::test]
    async fn non_finite_price_is_reported() {
        let adapter = FixedAdapter::new("bad", "HBAR-USD", "bad", f64::NAN);
        let err = adapter.fetch().await.expect_err("accepted NaN");
        assert!(matches!(err, AdapterError::NonFinitePrice { .. }));
        assert_eq!(err.adapter_id(), "bad");
    }
}
