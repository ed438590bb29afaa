//! Keyword pre-filter run before any paid LLM call.
//!
//! Cheap and deterministic. It leans towards letting messages through: the
//! classifier decides, this only drops what is plainly chatter.

/// Messages shorter than this (trimmed, in characters) never pass.
pub const MIN_PREFILTER_CHARS: usize = 30;

/// National-ID marker ("cédula de ciudadanía") as typed in orders.
pub const ID_MARKER: &str = "cc ";

/// ID, payment and delivery vocabulary.
const STRONG_INDICATORS: &[&str] = &["cc ", "fc ", "cédula", "cedula", "paga", "envío", "entrega"];

const PRODUCT_INDICATORS: &[&str] = &[
    "shampoo",
    "kit",
    "tratamiento",
    "sérum",
    "serum",
    "styling",
    "tónico",
];

const LOCATION_INDICATORS: &[&str] = &[
    "barrio", "calle", "carrera", "medellín", "bogotá", "cali", "ant",
];

const CONTACT_INDICATORS: &[&str] = &["@", "gmail", "hotmail", "llamar", "escribir"];

/// Conversational or administrative phrases; any hit rejects outright.
const NEGATIVE_INDICATORS: &[&str] = &[
    "este pedido es diferente",
    "no, es el mismo",
    "hola",
    "gracias",
    "envíos nacionales",
    "guía",
    "¿podrías ayudarme?",
    "esperando",
    "hola ana",
    "espero estés bien",
    "ayudarme con esta guía",
];

/// Per-category hit counts for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndicatorHits {
    pub strong: usize,
    pub product: usize,
    pub location: usize,
    pub contact: usize,
}

impl IndicatorHits {
    /// Number of categories with at least one hit (0..=4).
    pub fn categories(&self) -> usize {
        [self.strong, self.product, self.location, self.contact]
            .iter()
            .filter(|&&n| n > 0)
            .count()
    }

    pub fn accepts(&self) -> bool {
        self.categories() >= 2 && self.strong >= 1
    }
}

fn count_hits(haystack: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| haystack.contains(*n)).count()
}

/// Score `text` against the indicator tables. `None` when a negative phrase
/// is present.
pub fn score(text: &str) -> Option<IndicatorHits> {
    let lower = text.to_lowercase();
    if NEGATIVE_INDICATORS.iter().any(|neg| lower.contains(neg)) {
        return None;
    }
    Some(IndicatorHits {
        strong: count_hits(&lower, STRONG_INDICATORS),
        product: count_hits(&lower, PRODUCT_INDICATORS),
        location: count_hits(&lower, LOCATION_INDICATORS),
        contact: count_hits(&lower, CONTACT_INDICATORS),
    })
}

/// Whether `text` is worth an LLM classification call.
pub fn passes(text: &str) -> bool {
    if text.trim().chars().count() < MIN_PREFILTER_CHARS {
        return false;
    }
    score(text).is_some_and(|hits| hits.accepts())
}
