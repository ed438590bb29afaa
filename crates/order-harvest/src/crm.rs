//! CRM field extraction from formatted orders.
//!
//! The model is asked for a four-key JSON object. Replies are recovered in two
//! steps, `extract_json_candidate` then `parse_crm_response`, and anything that
//! does not satisfy the contract is retried. Extraction never fails outward:
//! the worst case is an empty record, which `extract_all` drops.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::errors::{truncate_chars, HarvestError};
use crate::formatter::FormattedOrder;
use crate::ledger::{CallKind, TokenUsage, UsageLedger};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pacing;
use crate::retry::RetryPolicy;

const KEY_NAME: &str = "nombre";
const KEY_NATIONAL_ID: &str = "cedula";
const KEY_EMAIL: &str = "email";
const KEY_BIRTHDATE: &str = "fecha_cumpleanos";
const REQUIRED_KEYS: [&str; 4] = [KEY_NAME, KEY_NATIONAL_ID, KEY_EMAIL, KEY_BIRTHDATE];

/// Partial cost is logged after every this many extractions.
pub const PARTIAL_COST_EVERY: usize = 10;

/// One customer's CRM fields. Any of them may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmRecord {
    #[serde(rename = "nombre")]
    pub name: String,
    /// Digits only.
    #[serde(rename = "cedula")]
    pub national_id: String,
    pub email: String,
    /// As written after `FC` in the order.
    #[serde(rename = "fecha_cumpleanos")]
    pub birthdate: String,
}

impl CrmRecord {
    /// Only named records make it into the CRM file.
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Locate the JSON payload inside a model reply.
///
/// A ```` ```json ```` fence wins over a bare ```` ``` ```` fence; with no
/// fence the whole reply is the candidate. An unterminated fence runs to the
/// end of the reply.
pub fn extract_json_candidate(raw: &str) -> &str {
    const LABELED: &str = "```json";
    const FENCE: &str = "```";

    let inner = if let Some(start) = raw.find(LABELED) {
        &raw[start + LABELED.len()..]
    } else if let Some(start) = raw.find(FENCE) {
        &raw[start + FENCE.len()..]
    } else {
        return raw.trim();
    };
    match inner.find(FENCE) {
        Some(end) => inner[..end].trim(),
        None => inner.trim(),
    }
}

fn field_text(object: &Map<String, Value>, key: &str) -> Result<String, HarvestError> {
    match object.get(key) {
        None => Err(HarvestError::ParseFailure(format!("missing key `{key}`"))),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(_) => Err(HarvestError::ParseFailure(format!(
            "key `{key}` is not a scalar"
        ))),
    }
}

/// Parse a model reply into a record. Every key must be present.
pub fn parse_crm_response(raw: &str) -> Result<CrmRecord, HarvestError> {
    let candidate = extract_json_candidate(raw);
    let value: Value = serde_json::from_str(candidate).map_err(|e| {
        HarvestError::ParseFailure(format!("{e}: {}", truncate_chars(candidate, 50)))
    })?;
    let Value::Object(object) = value else {
        return Err(HarvestError::ParseFailure("reply is not a JSON object".into()));
    };

    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(HarvestError::ParseFailure(format!(
            "incomplete JSON, missing {}",
            missing.join(", ")
        )));
    }

    Ok(CrmRecord {
        name: field_text(&object, KEY_NAME)?,
        national_id: field_text(&object, KEY_NATIONAL_ID)?
            .chars()
            .filter(char::is_ascii_digit)
            .collect(),
        email: field_text(&object, KEY_EMAIL)?,
        birthdate: field_text(&object, KEY_BIRTHDATE)?,
    })
}

fn build_prompt(order: &FormattedOrder) -> String {
    format!(
        r#"Del siguiente pedido formateado, extrae ÚNICAMENTE estos 4 datos específicos:

Pedido:
{order}

Extrae y responde SOLO en este formato JSON:
{{
    "nombre": "nombre completo de la persona (solo el nombre, sin títulos ni anotaciones)",
    "cedula": "número de cédula sin CC (solo números)",
    "email": "dirección de email completa",
    "fecha_cumpleanos": "fecha de cumpleaños (FC) tal como aparece"
}}

REGLAS:
- Si no encuentras algún dato, pon ""
- Para nombre: solo el nombre de la persona, sin (*Inter*), (*Distribuidora*), etc.
- Para cédula: solo los números, sin "CC"
- Para fecha: tal como aparece después de FC
- Responde SOLO el JSON, nada más"#
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmSettings {
    /// `parse_failure` covers bad JSON; the other tiers cover transport errors.
    pub retry: RetryPolicy,
    pub max_tokens: u32,
    #[serde(with = "crate::pacing::duration_secs")]
    pub timeout: Duration,
    #[serde(with = "crate::pacing::duration_secs")]
    pub success_pause: Duration,
    /// Pause between two extractions in `extract_all`.
    #[serde(with = "crate::pacing::duration_secs")]
    pub between_records: Duration,
    /// Replaces `between_records` after every `PARTIAL_COST_EVERY`th record.
    #[serde(with = "crate::pacing::duration_secs")]
    pub long_pause: Duration,
}

/// Completeness of an extracted CRM set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrmStats {
    pub records: usize,
    /// Emails containing `@`.
    pub with_email: usize,
    pub with_national_id: usize,
    pub with_birthdate: usize,
}

impl CrmStats {
    pub fn from_records(records: &[CrmRecord]) -> Self {
        Self {
            records: records.len(),
            with_email: records.iter().filter(|r| r.email.contains('@')).count(),
            with_national_id: records.iter().filter(|r| !r.national_id.is_empty()).count(),
            with_birthdate: records.iter().filter(|r| !r.birthdate.is_empty()).count(),
        }
    }

    fn percent(&self, n: usize) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            n as f64 / self.records as f64 * 100.0
        }
    }

    pub fn email_percent(&self) -> f64 {
        self.percent(self.with_email)
    }

    pub fn national_id_percent(&self) -> f64 {
        self.percent(self.with_national_id)
    }

    pub fn birthdate_percent(&self) -> f64 {
        self.percent(self.with_birthdate)
    }

    pub fn log(&self) {
        if self.records == 0 {
            return;
        }
        info!(
            records = self.records,
            emails = self.with_email,
            emails_pct = format!("{:.1}", self.email_percent()),
            national_ids = self.with_national_id,
            national_ids_pct = format!("{:.1}", self.national_id_percent()),
            birthdates = self.with_birthdate,
            birthdates_pct = format!("{:.1}", self.birthdate_percent()),
            "CRM completeness"
        );
    }
}

pub struct CrmExtractor {
    llm: Arc<dyn LlmClient>,
    settings: CrmSettings,
}

impl CrmExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, settings: CrmSettings) -> Self {
        Self { llm, settings }
    }

    /// Extract one record. Falls back to an empty record once the retry
    /// budget is spent.
    pub async fn extract(&self, order: &FormattedOrder, ledger: &mut UsageLedger) -> CrmRecord {
        let request = CompletionRequest {
            prompt: build_prompt(order),
            max_tokens: self.settings.max_tokens,
            timeout: self.settings.timeout,
        };

        // Tokens of rejected replies are still billed; they are booked with
        // the reply that finally parses.
        let spent: Cell<Option<TokenUsage>> = Cell::new(None);
        let llm = &self.llm;
        let request = &request;
        let spent_ref = &spent;
        let result = self
            .settings
            .retry
            .run("crm", move |_| async move {
                let completion = llm.complete(request).await?;
                if let Some(usage) = completion.usage {
                    let mut total = spent_ref.get().unwrap_or_default();
                    total += usage;
                    spent_ref.set(Some(total));
                }
                parse_crm_response(&completion.text)
            })
            .await;

        match result {
            Ok(record) => {
                ledger.record_response(CallKind::CrmExtraction, spent.get());
                pacing::pause(self.settings.success_pause).await;
                record
            }
            Err(err) => {
                let unbooked = spent.get().unwrap_or_default();
                warn!(
                    error = %err.truncated(80),
                    unbooked_tokens = unbooked.total(),
                    "CRM extraction failed; using empty record"
                );
                CrmRecord::default()
            }
        }
    }

    /// Extract every order in sequence, keeping only named records.
    pub async fn extract_all(
        &self,
        orders: &[FormattedOrder],
        ledger: &mut UsageLedger,
    ) -> Vec<CrmRecord> {
        let total = orders.len();
        let mut records = Vec::with_capacity(total);
        for (i, order) in orders.iter().enumerate() {
            let n = i + 1;
            info!(n, total, "extracting CRM fields");
            let record = self.extract(order, ledger).await;
            if record.is_named() {
                records.push(record);
            } else {
                warn!(n, first_line = %order.first_line(), "no name extracted; record dropped");
            }

            if n == total {
                break;
            }
            if n % PARTIAL_COST_EVERY == 0 {
                info!(
                    n,
                    cost = format!("{:.4}", ledger.cost().total_cost),
                    "partial CRM cost"
                );
                pacing::pause(self.settings.long_pause).await;
            } else {
                pacing::pause(self.settings.between_records).await;
            }
        }
        records
    }
}

impl std::fmt::Debug for CrmExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmExtractor")
            .field("model", &self.llm.model())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::Completion;
    use crate::retry::Backoff;

    const PAYLOAD: &str = r#"{"nombre": "Laura Gómez", "cedula": "CC 1.037.654.321", "email": "laura@gmail.com", "fecha_cumpleanos": "12 de marzo"}"#;

    struct Script {
        replies: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl Script {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmClient for Script {
        fn model(&self) -> &str {
            "script"
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, HarvestError> {
            *self.calls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(HarvestError::Request("connection reset".into()));
            }
            Ok(Completion::new(replies.remove(0), TokenUsage::new(300, 60)))
        }
    }

    fn settings() -> CrmSettings {
        CrmSettings {
            retry: RetryPolicy::uniform(4, Backoff::linear(3, 1))
                .with_parse_failure(Backoff::linear(2, 1)),
            max_tokens: 200,
            timeout: Duration::from_secs(20),
            success_pause: Duration::from_millis(500),
            between_records: Duration::from_secs(1),
            long_pause: Duration::from_secs(3),
        }
    }

    fn order(text: &str) -> FormattedOrder {
        FormattedOrder::new(text).unwrap()
    }

    #[test]
    fn candidate_extraction_handles_fences() {
        assert_eq!(extract_json_candidate("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_candidate("Aquí está:\n```\n{\"a\":1}\n```\nlisto"), "{\"a\":1}");
        assert_eq!(extract_json_candidate("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(extract_json_candidate("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn fenced_and_bare_payloads_parse_identically() {
        let fenced = parse_crm_response(&format!("```json\n{PAYLOAD}\n```")).unwrap();
        let bare = parse_crm_response(PAYLOAD).unwrap();
        assert_eq!(fenced, bare);
        assert_eq!(bare.name, "Laura Gómez");
        assert_eq!(bare.national_id, "1037654321");
        assert_eq!(bare.birthdate, "12 de marzo");
    }

    #[test]
    fn scalar_values_are_normalised() {
        let record = parse_crm_response(
            r#"{"nombre": "  Ana ", "cedula": 52123456, "email": null, "fecha_cumpleanos": ""}"#,
        )
        .unwrap();
        assert_eq!(record.name, "Ana");
        assert_eq!(record.national_id, "52123456");
        assert_eq!(record.email, "");
    }

    #[test]
    fn malformed_replies_are_parse_failures() {
        for raw in [
            "no JSON here",
            "```json\n{\"nombre\": \"Ana\"\n```",
            "[1, 2, 3]",
            r#"{"nombre": "Ana", "cedula": "1", "email": ""}"#,
            r#"{"nombre": ["Ana"], "cedula": "1", "email": "", "fecha_cumpleanos": ""}"#,
        ] {
            let err = parse_crm_response(raw).unwrap_err();
            assert!(matches!(err, HarvestError::ParseFailure(_)), "{raw}: {err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_triggers_retry() {
        let llm = Script::new(&[
            r#"{"nombre": "Laura Gómez", "cedula": "1037654321", "email": "laura@gmail.com"}"#,
            PAYLOAD,
        ]);
        let extractor = CrmExtractor::new(llm.clone(), settings());
        let mut ledger = UsageLedger::default();
        let record = extractor.extract(&order("Laura Gómez\nCC 1037654321"), &mut ledger).await;

        assert_eq!(llm.calls(), 2);
        assert_eq!(record.email, "laura@gmail.com");
        // Both attempts booked as one request.
        assert_eq!(ledger.requests(CallKind::CrmExtraction), 1);
        assert_eq!(ledger.usage(), TokenUsage::new(600, 120));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_extraction_yields_empty_record() {
        let llm = Script::new(&["nope", "nope"]);
        let extractor = CrmExtractor::new(llm.clone(), settings());
        let mut ledger = UsageLedger::default();
        let start = tokio::time::Instant::now();
        let record = extractor.extract(&order("Laura"), &mut ledger).await;

        assert_eq!(record, CrmRecord::default());
        assert_eq!(llm.calls(), 4);
        assert_eq!(ledger.total_requests(), 0);
        // parse 2, parse 3, request 5
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 3 + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn extract_all_drops_unnamed_records() {
        let llm = Script::new(&[
            PAYLOAD,
            r#"{"nombre": "", "cedula": "", "email": "", "fecha_cumpleanos": ""}"#,
        ]);
        let extractor = CrmExtractor::new(llm, settings());
        let mut ledger = UsageLedger::default();
        let records = extractor
            .extract_all(&[order("Laura"), order("Sin nombre")], &mut ledger)
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Laura Gómez");
        assert_eq!(ledger.requests(CallKind::CrmExtraction), 2);
    }

    #[test]
    fn stats_count_complete_fields() {
        let records = vec![
            CrmRecord {
                name: "Ana".into(),
                national_id: "1".into(),
                email: "ana@x.co".into(),
                birthdate: String::new(),
            },
            CrmRecord {
                name: "Luz".into(),
                national_id: String::new(),
                email: "sin correo".into(),
                birthdate: "3 mayo".into(),
            },
        ];
        let stats = CrmStats::from_records(&records);
        assert_eq!(stats.with_email, 1);
        assert_eq!(stats.with_national_id, 1);
        assert_eq!(stats.with_birthdate, 1);
        assert_eq!(stats.email_percent(), 50.0);
        assert_eq!(CrmStats::default().email_percent(), 0.0);
    }

    #[test]
    fn record_serialises_with_spanish_keys() {
        let json = serde_json::to_value(CrmRecord {
            name: "Ana".into(),
            ..CrmRecord::default()
        })
        .unwrap();
        assert_eq!(json["nombre"], "Ana");
        assert!(json.get("fecha_cumpleanos").is_some());
    }
}
