//! Rewrites an order message into the fixed catalogue layout.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checkpoint::{ESCAPED_MARKER, SEPARATOR_MARKER};
use crate::errors::HarvestError;
use crate::ledger::{CallKind, TokenUsage, UsageLedger};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pacing;
use crate::retry::RetryPolicy;

/// Normalized order text: name, `CC` line, `FC` line, address, `Barrio`,
/// city, phone, email, products, payment status.
///
/// Always trimmed and non-empty, and never contains the checkpoint separator
/// marker, so a checkpoint file splits back into exactly the values written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormattedOrder(String);

impl FormattedOrder {
    /// `None` when `text` is blank.
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let trimmed = text.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.replace(SEPARATOR_MARKER, ESCAPED_MARKER)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First line, normally the customer's name.
    pub fn first_line(&self) -> &str {
        self.0.lines().next().unwrap_or_default()
    }

    /// First `n` lines plus the count of lines left out.
    pub fn preview(&self, n: usize) -> (Vec<&str>, usize) {
        let lines: Vec<&str> = self.0.lines().collect();
        let hidden = lines.len().saturating_sub(n);
        (lines.into_iter().take(n).collect(), hidden)
    }
}

impl fmt::Display for FormattedOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FormattedOrder {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatterSettings {
    pub retry: RetryPolicy,
    pub max_tokens: u32,
    #[serde(with = "crate::pacing::duration_secs")]
    pub timeout: Duration,
    #[serde(with = "crate::pacing::duration_secs")]
    pub success_pause: Duration,
}

pub struct OrderFormatter {
    llm: Arc<dyn LlmClient>,
    settings: FormatterSettings,
}

fn build_prompt(text: &str) -> String {
    format!(
        r#"Extrae información de este pedido de WhatsApp en formato exacto:

[Nombre completo de la persona]
CC [número completo de cédula]
FC [fecha completa]
[dirección completa con número y apartamento]
Barrio [nombre del barrio]
[ciudad completa con departamento]
[teléfono completo con notas]
[email completo]
[productos completos con cantidades]
[estado de pago completo con detalles]

REGLAS:
- Mantén TODOS los detalles originales
- Copia direcciones exactas
- Incluye notas de teléfono
- Conserva información de pago completa
- Si algún detalle no encaja en ningún campo, déjalo en la línea más cercana; no lo elimines

Mensaje original:
{text}

Formatea manteniendo TODOS los detalles:"#
    )
}

impl OrderFormatter {
    pub fn new(llm: Arc<dyn LlmClient>, settings: FormatterSettings) -> Self {
        Self { llm, settings }
    }

    /// `None` once every attempt has failed; the caller counts that as an
    /// error and moves on.
    pub async fn format(&self, text: &str, ledger: &mut UsageLedger) -> Option<FormattedOrder> {
        let request = CompletionRequest {
            prompt: build_prompt(text),
            max_tokens: self.settings.max_tokens,
            timeout: self.settings.timeout,
        };

        // Blank replies are billed too; booked with the reply that is kept.
        let spent: Cell<Option<TokenUsage>> = Cell::new(None);
        let llm = &self.llm;
        let request = &request;
        let spent_ref = &spent;
        let result = self
            .settings
            .retry
            .run("format", move |_| async move {
                let completion = llm.complete(request).await?;
                if let Some(usage) = completion.usage {
                    let mut total = spent_ref.get().unwrap_or_default();
                    total += usage;
                    spent_ref.set(Some(total));
                }
                FormattedOrder::new(&completion.text)
                    .ok_or_else(|| HarvestError::ParseFailure("empty formatter reply".into()))
            })
            .await;

        match result {
            Ok(order) => {
                ledger.record_response(CallKind::Formatting, spent.get());
                pacing::pause(self.settings.success_pause).await;
                Some(order)
            }
            Err(err) => {
                let unbooked = spent.get().unwrap_or_default();
                warn!(
                    error = %err.truncated(80),
                    unbooked_tokens = unbooked.total(),
                    "formatting gave up"
                );
                None
            }
        }
    }
}
