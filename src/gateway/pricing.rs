use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::store_types::QuotaMetric;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPrice {
    pub quota_per_request: i64,
    pub quota_per_1k_tokens: i64,
}

/// Registered model aliases. Fallback reroutes are only allowed to priced aliases.
#[derive(Debug, Default)]
pub struct PricingTable {
    models: RwLock<BTreeMap<String, ModelPrice>>,
}

impl PricingTable {
    pub fn new(models: BTreeMap<String, ModelPrice>) -> Self {
        let models = models
            .into_iter()
            .map(|(alias, price)| (normalize_alias(&alias), price))
            .collect();
        Self {
            models: RwLock::new(models),
        }
    }

    pub fn contains(&self, alias: &str) -> bool {
        let alias = normalize_alias(alias);
        self.models
            .read()
            .map(|models| models.contains_key(&alias))
            .unwrap_or(false)
    }

    pub fn price(&self, alias: &str) -> Option<ModelPrice> {
        let alias = normalize_alias(alias);
        self.models
            .read()
            .ok()
            .and_then(|models| models.get(&alias).cloned())
    }

    pub fn upsert(&self, alias: &str, price: ModelPrice) {
        if let Ok(mut models) = self.models.write() {
            models.insert(normalize_alias(alias), price);
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        self.models
            .read()
            .map(|models| models.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Charge amount in units of the plan metric.
    ///
    /// `requests` always costs one unit and `tokens` the total token count. `credits`
    /// use the model price, falling back to one credit per request for unpriced models.
    pub fn amount(&self, metric: QuotaMetric, alias: &str, total_tokens: i64) -> i64 {
        let total_tokens = total_tokens.max(0);
        match metric {
            QuotaMetric::Requests => 1,
            QuotaMetric::Tokens => total_tokens.max(1),
            QuotaMetric::Credits => match self.price(alias) {
                Some(price) => {
                    let token_part = price
                        .quota_per_1k_tokens
                        .saturating_mul(total_tokens)
                        .saturating_add(999)
                        / 1000;
                    price.quota_per_request.saturating_add(token_part).max(1)
                }
                None => 1,
            },
        }
    }
}

fn normalize_alias(alias: &str) -> String {
    alias.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        let mut models = BTreeMap::new();
        models.insert(
            "GPT-4o".to_string(),
            ModelPrice {
                quota_per_request: 2,
                quota_per_1k_tokens: 10,
            },
        );
        PricingTable::new(models)
    }

    #[test]
    fn aliases_are_case_insensitive() {
        let table = table();
        assert!(table.contains(" gpt-4o"));
        assert!(!table.contains("gpt-4o-mini"));
    }

    #[test]
    fn credit_amount_rounds_token_part_up() {
        let table = table();
        assert_eq!(table.amount(QuotaMetric::Credits, "gpt-4o", 1500), 2 + 15);
        assert_eq!(table.amount(QuotaMetric::Credits, "gpt-4o", 1), 3);
        assert_eq!(table.amount(QuotaMetric::Credits, "unknown", 1000), 1);
        assert_eq!(table.amount(QuotaMetric::Requests, "gpt-4o", 1000), 1);
        assert_eq!(table.amount(QuotaMetric::Tokens, "gpt-4o", 0), 1);
    }
}
