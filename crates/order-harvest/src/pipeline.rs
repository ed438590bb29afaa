//! Batch orchestration: fetch once, then funnel every message through the
//! length gate, pre-filter, classifier and formatter.
//!
//! ## Lifecycle
//!
//! ```text
//! Pipeline::run_batch(chat_id, limit, start_from)
//!   → checkpoint.load()            resumed orders; skip that many positions
//!   → source.fetch(chat_id, limit) one gateway call; empty means done
//!   → per message:
//!       < MIN_MESSAGE_CHARS        Skipped
//!       prefilter::passes == false PrefilterRejected
//!       classifier says no         ClassifiedNo (counted as skipped)
//!       formatter gives up         FormatError
//!       otherwise                  OrderAccepted, checkpoint rewritten
//! Pipeline::finish(orders)         CRM extraction
//! ```
//!
//! Nothing after INIT aborts the batch. Checkpoint writes that fail are
//! logged and the run carries on with the in-memory sequence.

use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::classifier::OrderClassifier;
use crate::config::PipelineProfile;
use crate::crm::{CrmExtractor, CrmRecord};
use crate::errors::{truncate_chars, HarvestError};
use crate::formatter::{FormattedOrder, OrderFormatter};
use crate::ledger::{Pricing, UsageLedger};
use crate::llm::LlmClient;
use crate::pacing;
use crate::prefilter;
use crate::source::MessageSource;

/// Messages shorter than this (trimmed, in characters) are skipped unseen.
pub const MIN_MESSAGE_CHARS: usize = 20;

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Skipped,
    PrefilterRejected,
    ClassifiedNo,
    FormatError,
    OrderAccepted,
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Messages in the fetched batch.
    pub total_analyzed: usize,
    pub prefilter_rejected: usize,
    /// Orders produced by this run, not counting resumed ones.
    pub accepted: usize,
    /// Too short, or classified as not an order.
    pub skipped: usize,
    pub errors: usize,
    /// Orders loaded from the checkpoint.
    pub resumed: usize,
}

impl RunStats {
    pub fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Skipped | MessageOutcome::ClassifiedNo => self.skipped += 1,
            MessageOutcome::PrefilterRejected => self.prefilter_rejected += 1,
            MessageOutcome::FormatError => self.errors += 1,
            MessageOutcome::OrderAccepted => self.accepted += 1,
        }
    }

    /// `accepted / total_analyzed`, 0 for an empty batch.
    pub fn efficiency(&self) -> f64 {
        if self.total_analyzed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.total_analyzed as f64
        }
    }

    pub fn log(&self) {
        info!(
            total_analyzed = self.total_analyzed,
            prefilter_rejected = self.prefilter_rejected,
            accepted = self.accepted,
            skipped = self.skipped,
            errors = self.errors,
            resumed = self.resumed,
            efficiency_pct = format!("{:.1}", self.efficiency() * 100.0),
            "batch finished"
        );
    }
}

/// Orders (resumed first, then new) plus counters.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub orders: Vec<FormattedOrder>,
    pub stats: RunStats,
}

pub struct Pipeline {
    source: Arc<dyn MessageSource>,
    classifier: OrderClassifier,
    formatter: OrderFormatter,
    crm: CrmExtractor,
    checkpoint: CheckpointStore,
    profile: PipelineProfile,
    ledger: UsageLedger,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        llm: Arc<dyn LlmClient>,
        profile: PipelineProfile,
        checkpoint: CheckpointStore,
        pricing: Pricing,
    ) -> Self {
        Self {
            source,
            classifier: OrderClassifier::new(llm.clone(), profile.classifier.clone()),
            formatter: OrderFormatter::new(llm.clone(), profile.formatter.clone()),
            crm: CrmExtractor::new(llm, profile.crm.clone()),
            checkpoint,
            profile,
            ledger: UsageLedger::new(pricing),
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn profile(&self) -> &PipelineProfile {
        &self.profile
    }

    /// Fetch one batch and turn its order messages into formatted orders.
    ///
    /// Positions below `start_from`, and below the number of checkpointed
    /// orders, are not looked at. Only an unreadable checkpoint is an error.
    pub async fn run_batch(
        &mut self,
        chat_id: &str,
        limit: usize,
        start_from: usize,
    ) -> Result<BatchOutcome, HarvestError> {
        let mut orders = self.checkpoint.load()?;
        let mut stats = RunStats {
            resumed: orders.len(),
            ..RunStats::default()
        };
        if stats.resumed > 0 {
            info!(resumed = stats.resumed, "resuming from checkpoint");
        }

        let messages = self.source.fetch(chat_id, limit).await;
        if messages.is_empty() {
            warn!(chat_id, "no messages fetched");
            return Ok(BatchOutcome { orders, stats });
        }
        stats.total_analyzed = messages.len();
        info!(
            fetched = messages.len(),
            profile = %self.profile.kind,
            "starting analysis"
        );

        let total = messages.len();
        for message in &messages {
            if message.position < start_from || message.position < stats.resumed {
                continue;
            }
            let outcome = self
                .process(message.position, total, &message.body, &mut orders)
                .await;
            stats.record(outcome);
        }

        stats.log();
        Ok(BatchOutcome { orders, stats })
    }

    async fn process(
        &mut self,
        position: usize,
        total: usize,
        text: &str,
        orders: &mut Vec<FormattedOrder>,
    ) -> MessageOutcome {
        if text.trim().chars().count() < MIN_MESSAGE_CHARS {
            return MessageOutcome::Skipped;
        }

        info!(
            message = position + 1,
            total,
            preview = %truncate_chars(text, 80),
            "analysing message"
        );

        if !prefilter::passes(text) {
            info!(message = position + 1, "pre-filter rejected");
            pacing::pause(self.profile.prefilter_reject_pause).await;
            return MessageOutcome::PrefilterRejected;
        }

        let mut checkpoint_paused = false;
        let outcome = if !self.classifier.is_order(text, &mut self.ledger).await {
            info!(message = position + 1, "not an order");
            MessageOutcome::ClassifiedNo
        } else {
            match self.formatter.format(text, &mut self.ledger).await {
                None => {
                    warn!(message = position + 1, "formatting failed; continuing");
                    MessageOutcome::FormatError
                }
                Some(order) => {
                    info!(n = orders.len() + 1, first_line = %order.first_line(), "order accepted");
                    orders.push(order);
                    if let Err(err) = self.checkpoint.save(orders) {
                        warn!(error = %err, path = %self.checkpoint.path().display(), "checkpoint write failed");
                    }
                    checkpoint_paused = self.maybe_checkpoint_pause(orders.len()).await;
                    MessageOutcome::OrderAccepted
                }
            }
        };

        if !checkpoint_paused {
            pacing::delay(self.profile.message_pause, "between messages").await;
        }
        outcome
    }

    /// Partial cost report and long pause every `checkpoint_every` orders.
    async fn maybe_checkpoint_pause(&self, order_count: usize) -> bool {
        let every = self.profile.checkpoint_every;
        if every == 0 || order_count % every != 0 {
            return false;
        }
        let cost = self.ledger.cost();
        info!(
            orders = order_count,
            requests = cost.total_requests,
            cost = format!("{:.4}", cost.total_cost),
            "checkpoint"
        );
        pacing::delay(self.profile.checkpoint_pause, "checkpoint").await;
        true
    }

    /// Extract CRM records for `orders`.
    pub async fn finish(&mut self, orders: &[FormattedOrder]) -> Vec<CrmRecord> {
        self.crm.extract_all(orders, &mut self.ledger).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("profile", &self.profile.kind)
            .field("checkpoint", &self.checkpoint)
            .field("ledger", &self.ledger)
            .finish()
    }
}
