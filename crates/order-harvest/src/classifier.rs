//! LLM-backed order / not-order verdict.
//!
//! Always terminates with a boolean. When the retry budget runs out the
//! verdict comes from a deterministic heuristic instead of the model.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::truncate_chars;
use crate::ledger::{CallKind, UsageLedger};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pacing;
use crate::prefilter::{self, ID_MARKER};
use crate::retry::RetryPolicy;

/// Minimum line count for the offline fallback to call something an order.
pub const FALLBACK_MIN_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub retry: RetryPolicy,
    pub max_tokens: u32,
    #[serde(with = "crate::pacing::duration_secs")]
    pub timeout: Duration,
    /// Characters of the message embedded in the prompt.
    pub prompt_char_cap: usize,
    /// Pause after every successful call.
    #[serde(with = "crate::pacing::duration_secs")]
    pub success_pause: Duration,
}

pub struct OrderClassifier {
    llm: Arc<dyn LlmClient>,
    settings: ClassifierSettings,
}

fn build_prompt(text: &str, cap: usize) -> String {
    let excerpt = truncate_chars(text, cap);
    format!(
        r#"Analiza si este mensaje de WhatsApp es un PEDIDO DE PRODUCTOS válido.

PEDIDO VÁLIDO debe tener:
- Nombre de persona
- Documento (CC/cédula)
- Dirección de entrega
- Productos (shampoo, kit, tratamiento, etc.)
- Info de pago/contacto

NO SON PEDIDOS:
- Conversaciones/preguntas
- Confirmaciones administrativas
- Mensajes sobre envíos nacionales
- Respuestas cortas

Mensaje: "{excerpt}"

Responde SOLO: "SI" o "NO""#
    )
}

/// Interpret the model's one-word answer.
pub fn parse_verdict(answer: &str) -> bool {
    let word: String = answer
        .trim()
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect::<String>()
        .to_uppercase();
    matches!(word.as_str(), "SI" | "SÍ" | "YES")
}

/// Offline verdict used when the model cannot be reached.
pub fn fallback_verdict(text: &str) -> bool {
    prefilter::passes(text)
        && text.split('\n').count() >= FALLBACK_MIN_LINES
        && text.to_lowercase().contains(ID_MARKER)
}

impl OrderClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, settings: ClassifierSettings) -> Self {
        Self { llm, settings }
    }

    pub async fn is_order(&self, text: &str, ledger: &mut UsageLedger) -> bool {
        if !prefilter::passes(text) {
            return false;
        }

        let request = CompletionRequest {
            prompt: build_prompt(text, self.settings.prompt_char_cap),
            max_tokens: self.settings.max_tokens,
            timeout: self.settings.timeout,
        };

        let llm = &self.llm;
        let request = &request;
        let result = self
            .settings
            .retry
            .run("classify", move |_| llm.complete(request))
            .await;

        match result {
            Ok(completion) => {
                ledger.record_response(CallKind::Classification, completion.usage);
                pacing::pause(self.settings.success_pause).await;
                parse_verdict(&completion.text)
            }
            Err(err) => {
                let verdict = fallback_verdict(text);
                warn!(error = %err.truncated(80), verdict, "classifier unavailable; using heuristic fallback");
                verdict
            }
        }
    }
}

impl std::fmt::Debug for OrderClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderClassifier")
            .field("model", &self.llm.model())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::errors::HarvestError;
    use crate::ledger::TokenUsage;
    use crate::llm::Completion;
    use crate::retry::Backoff;

    const ORDER: &str = "Laura Gómez\nCC 1037654321\nFC 12 de marzo\nCalle 10 # 43-12\n\
                         Barrio El Poblado\nMedellín\n3001234567\nlaura@gmail.com\n2 shampoo\nPaga";

    struct Fixed {
        answer: Result<&'static str, ()>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for Fixed {
        fn model(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, HarvestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.prompt.contains("Responde SOLO"));
            match self.answer {
                Ok(text) => Ok(Completion::new(text, TokenUsage::new(150, 1))),
                Err(()) => Err(HarvestError::Timeout("deadline".into())),
            }
        }
    }

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            retry: RetryPolicy::tiered(
                4,
                Backoff::linear(8, 4),
                Backoff::linear(15, 5),
                Backoff::linear(5, 3),
            ),
            max_tokens: 5,
            timeout: Duration::from_secs(20),
            prompt_char_cap: 600,
            success_pause: Duration::from_secs(1),
        }
    }

    fn classifier(answer: Result<&'static str, ()>) -> (OrderClassifier, Arc<Fixed>) {
        let llm = Arc::new(Fixed {
            answer,
            calls: AtomicU32::new(0),
        });
        (OrderClassifier::new(llm.clone(), settings()), llm)
    }

    #[test]
    fn verdict_parsing_is_lenient() {
        assert!(parse_verdict("SI"));
        assert!(parse_verdict(" sí.\n"));
        assert!(parse_verdict("\"SI\""));
        assert!(parse_verdict("Yes"));
        assert!(!parse_verdict("NO"));
        assert!(!parse_verdict("SI, pero..."));
        assert!(!parse_verdict(""));
    }

    #[test]
    fn prompt_truncates_on_char_boundary() {
        let long = "ñ".repeat(1000);
        let prompt = build_prompt(&long, 600);
        assert_eq!(prompt.matches('ñ').count(), 600);
    }

    #[test]
    fn fallback_requires_lines_and_id_marker() {
        assert!(fallback_verdict(ORDER));
        let no_marker = ORDER.replace("CC ", "Doc ");
        assert!(!fallback_verdict(&no_marker));
        let one_line = ORDER.replace('\n', " ");
        assert!(!fallback_verdict(&one_line));
    }

    #[tokio::test(start_paused = true)]
    async fn yes_answer_is_recorded_in_ledger() {
        let (classifier, llm) = classifier(Ok("SI"));
        let mut ledger = UsageLedger::default();
        assert!(classifier.is_order(ORDER, &mut ledger).await);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.requests(CallKind::Classification), 1);
        assert_eq!(ledger.usage(), TokenUsage::new(150, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn prefilter_reject_skips_the_model() {
        let (classifier, llm) = classifier(Ok("SI"));
        let mut ledger = UsageLedger::default();
        assert!(!classifier.is_order("hola, ¿cómo vas? todo bien por acá", &mut ledger).await);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.total_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_falls_back_to_heuristic() {
        let (classifier, llm) = classifier(Err(()));
        let mut ledger = UsageLedger::default();
        let start = tokio::time::Instant::now();
        assert!(classifier.is_order(ORDER, &mut ledger).await);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
        assert_eq!(ledger.total_requests(), 0);
        // timeout tier: 8 + 12 + 16
        assert_eq!(start.elapsed(), Duration::from_secs(36));
    }
}
