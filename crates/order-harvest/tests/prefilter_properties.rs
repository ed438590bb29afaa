//! Pre-filter acceptance rules checked over engineered inputs.

use order_harvest::prefilter::{passes, score, MIN_PREFILTER_CHARS};

const STRONG: &str = "cédula";
const PRODUCT: &str = "shampoo";
const LOCATION: &str = "barrio";
const CONTACT: &str = "gmail";
/// Hits no indicator and pads every probe past the length floor.
const FILLER: &str = "xxxx yyyy zzzz wwww qqqq";

const ORDER: &str = "Laura Gómez\nCC 1037654321\nFC 12 de marzo\nCalle 10 # 43-12\n\
                     Barrio El Poblado\nMedellín\n3001234567\nlaura@gmail.com\n2 shampoo\nPaga";

fn probe(words: &[&str]) -> String {
    format!("{} {FILLER}", words.join(" "))
}

#[test]
fn every_category_combination() {
    let categories = [STRONG, PRODUCT, LOCATION, CONTACT];
    for mask in 0u8..16 {
        let words: Vec<&str> = categories
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, w)| *w)
            .collect();
        let text = probe(&words);
        let hits = score(&text).unwrap();
        assert_eq!(hits.categories(), words.len(), "{text}");

        let expected = words.len() >= 2 && mask & 1 != 0;
        assert_eq!(passes(&text), expected, "{text}");
    }
}

#[test]
fn exactly_one_category_is_rejected() {
    assert!(!passes("cédula 1037654321 y paga mañana temprano por favor"));
    assert!(!passes("shampoo, sérum y tónico para el cabello rizado"));
}

#[test]
fn two_categories_need_a_strong_hit() {
    assert!(passes("cédula 1037654321, quiero dos shampoo de romero"));
    assert!(!passes("shampoo y kit para el barrio Laureles de la ciudad"));
}

#[test]
fn all_four_categories_pass() {
    assert_eq!(score(ORDER).unwrap().categories(), 4);
    assert!(passes(ORDER));
}

#[test]
fn negative_phrase_overrides_everything() {
    for phrase in [
        "Hola",
        "gracias",
        "GUÍA",
        "Esperando",
        "este pedido es diferente",
        "espero estés bien",
    ] {
        let text = format!("{phrase}\n{ORDER}");
        assert!(score(&text).is_none(), "{phrase}");
        assert!(!passes(&text), "{phrase}");
    }
}

#[test]
fn anything_under_the_length_floor_is_rejected() {
    let chars: Vec<char> = ORDER.chars().collect();
    for n in 0..MIN_PREFILTER_CHARS {
        let prefix: String = chars[..n].iter().collect();
        assert!(!passes(&prefix), "{n} chars: {prefix:?}");
    }
    let padded = format!("   \n\t{}   ", chars[..MIN_PREFILTER_CHARS - 1].iter().collect::<String>());
    assert!(!passes(&padded));
}
