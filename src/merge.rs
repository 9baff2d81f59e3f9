// src/merge.rs
//! Attach live quotes to per-symbol records. Pure and total: a symbol the
//! snapshot does not know keeps exactly the record it came in with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ingest::market::{MarketQuote, MarketSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub symbol: String,
    /// Free-form per-symbol fields (mention counts, velocity, model output).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<MarketQuote>,
}

impl AnalysisRecord {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            fields: Map::new(),
            market: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

pub fn merge(records: Vec<AnalysisRecord>, snapshot: &MarketSnapshot) -> Vec<AnalysisRecord> {
    records
        .into_iter()
        .map(|mut rec| {
            if let Some(q) = snapshot.get(&rec.symbol) {
                rec.market = Some(q.clone());
            }
            rec
        })
        .collect()
}
