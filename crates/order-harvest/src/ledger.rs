//! Token usage and cost accounting for the metered LLM calls.
//!
//! The ledger is an owned value threaded through every stage as
//! `&mut UsageLedger`; nothing in this crate keeps global counters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Which pipeline stage made an LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Classification,
    Formatting,
    CrmExtraction,
}

impl CallKind {
    pub const ALL: [CallKind; 3] = [
        CallKind::Classification,
        CallKind::Formatting,
        CallKind::CrmExtraction,
    ];
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => write!(f, "verification"),
            Self::Formatting => write!(f, "format"),
            Self::CrmExtraction => write!(f, "crm_extraction"),
        }
    }
}

/// Token counts reported by the LLM service for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Price per million tokens, in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.80,
            output_per_million: 4.00,
        }
    }
}

/// Monetary view of the ledger at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Derived view used for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub cost: CostReport,
    pub requests_by_kind: BTreeMap<CallKind, u64>,
    /// `None` until at least one request was recorded.
    pub cost_per_request: Option<f64>,
    pub projected_100: Option<f64>,
    pub projected_1000: Option<f64>,
}

impl LedgerSummary {
    /// Emit the report through `tracing`.
    pub fn log(&self) {
        let c = &self.cost;
        info!(
            total_requests = c.total_requests,
            verification = self.requests(CallKind::Classification),
            format = self.requests(CallKind::Formatting),
            crm_extraction = self.requests(CallKind::CrmExtraction),
            "LLM usage"
        );
        info!(
            input_tokens = c.input_tokens,
            output_tokens = c.output_tokens,
            total_tokens = c.total_tokens,
            "token totals"
        );
        info!(
            input_cost = format!("${:.4}", c.input_cost),
            output_cost = format!("${:.4}", c.output_cost),
            total_cost = format!("${:.4}", c.total_cost),
            "session cost"
        );
        if let (Some(per), Some(p100), Some(p1000)) =
            (self.cost_per_request, self.projected_100, self.projected_1000)
        {
            info!(
                per_request = format!("${per:.4}"),
                per_100 = format!("${p100:.2}"),
                per_1000 = format!("${p1000:.2}"),
                "cost projection"
            );
        }
    }

    pub fn requests(&self, kind: CallKind) -> u64 {
        self.requests_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Running account of LLM usage for one run. Never reset.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    pricing: Pricing,
    usage: TokenUsage,
    requests: BTreeMap<CallKind, u64>,
}

impl UsageLedger {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            pricing,
            usage: TokenUsage::default(),
            requests: BTreeMap::new(),
        }
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    /// Count one request of `kind` and add its tokens to the totals.
    pub fn record(&mut self, kind: CallKind, usage: TokenUsage) {
        self.usage += usage;
        *self.requests.entry(kind).or_insert(0) += 1;
        debug!(
            kind = %kind,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "usage recorded"
        );
    }

    /// Record a response whose usage block may be missing.
    ///
    /// A missing block is logged and ignored.
    pub fn record_response(&mut self, kind: CallKind, usage: Option<TokenUsage>) {
        match usage {
            Some(usage) => self.record(kind, usage),
            None => warn!(kind = %kind, "response carried no usage block; not recorded"),
        }
    }

    pub fn requests(&self, kind: CallKind) -> u64 {
        self.requests.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn cost(&self) -> CostReport {
        let input_cost = self.usage.input_tokens as f64 / 1_000_000.0 * self.pricing.input_per_million;
        let output_cost =
            self.usage.output_tokens as f64 / 1_000_000.0 * self.pricing.output_per_million;
        CostReport {
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
            total_tokens: self.usage.total(),
            total_requests: self.total_requests(),
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let cost = self.cost();
        let cost_per_request = if cost.total_requests > 0 {
            Some(cost.total_cost / cost.total_requests as f64)
        } else {
            None
        };
        let mut requests_by_kind = BTreeMap::new();
        for kind in CallKind::ALL {
            requests_by_kind.insert(kind, self.requests(kind));
        }
        LedgerSummary {
            cost,
            requests_by_kind,
            cost_per_request,
            projected_100: cost_per_request.map(|c| c * 100.0),
            projected_1000: cost_per_request.map(|c| c * 1000.0),
        }
    }
}
