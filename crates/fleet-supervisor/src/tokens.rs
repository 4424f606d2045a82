//! Tool-schema token counting, surfaced for orchestrator budgeting.

use anyhow::Result;
use tiktoken_rs::CoreBPE;

/// Counts the token cost of a serialized tool schema.
///
/// Pluggable so deployments can match whatever tokenizer their orchestrator
/// budgets with; when no counter is available the fleet reports
/// `token_count = 0` together with a `tools_error`.
pub trait SchemaTokenCounter: Send + Sync {
    fn count(&self, schema_json: &str) -> Result<usize>;
}

/// Default counter: the `cl100k_base` BPE (GPT-3.5/4 family encoding).
pub struct Cl100kCounter {
    bpe: CoreBPE,
}

impl Cl100kCounter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl SchemaTokenCounter for Cl100kCounter {
    fn count(&self, schema_json: &str) -> Result<usize> {
        Ok(self.bpe.encode_with_special_tokens(schema_json).len())
    }
}
