//! Unit extraction from free-text listing names.
//!
//! An ordered pattern table is tried top to bottom and the first hit wins;
//! the order is part of the contract (it arbitrates between patterns that
//! could both match, e.g. "6 unidades" inside "pack 6 unidades").
//! Measurement units require an adjacent number so that a bare "unidad" in
//! an unrelated context never matches; container words may appear without
//! one, in which case the quantity defaults to 1.

use regex::Regex;

/// Quantity assumed when a container word appears without an explicit number.
pub const CONTAINER_DEFAULT_QUANTITY: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Kg,
    G,
    Ml,
    Litro,
    Unidad,
    Pack,
    Caja,
    Barra,
    Sobre,
}

impl UnitKind {
    pub fn canonical(&self) -> &'static str {
        match self {
            UnitKind::Kg => "kg",
            UnitKind::G => "g",
            UnitKind::Ml => "ml",
            UnitKind::Litro => "litro",
            UnitKind::Unidad => "unidad",
            UnitKind::Pack => "pack",
            UnitKind::Caja => "caja",
            UnitKind::Barra => "barra",
            UnitKind::Sobre => "sobre",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            UnitKind::Pack | UnitKind::Caja | UnitKind::Barra | UnitKind::Sobre
        )
    }

    /// Lenient token lookup for human-supplied unit strings (review queue
    /// edits arrive as free text).
    pub fn from_token(raw: &str) -> Option<UnitKind> {
        let t = raw.trim().to_lowercase();
        match t.as_str() {
            "kg" | "kgs" | "kilo" | "kilos" | "kilogramo" | "kilogramos" => Some(UnitKind::Kg),
            "g" | "gr" | "grs" | "gramo" | "gramos" | "gram" | "grams" => Some(UnitKind::G),
            "ml" | "mililitro" | "mililitros" | "milliliter" | "milliliters" => Some(UnitKind::Ml),
            "l" | "lt" | "lts" | "litro" | "litros" => Some(UnitKind::Litro),
            "u" | "u." | "unidad" | "unidades" | "unit" | "units" => Some(UnitKind::Unidad),
            "pack" | "packs" => Some(UnitKind::Pack),
            "caja" | "cajas" => Some(UnitKind::Caja),
            "barra" | "barras" => Some(UnitKind::Barra),
            "sobre" | "sobres" => Some(UnitKind::Sobre),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitMatch {
    pub unit: UnitKind,
    /// Exact substring matched in the lower-cased name; the cleaner removes
    /// precisely this token.
    pub matched: String,
    pub value: f64,
}

pub struct UnitTable {
    patterns: Vec<(UnitKind, Regex)>,
}

impl UnitTable {
    pub fn with_defaults() -> Self {
        let table: [(UnitKind, &str); 9] = [
            (
                UnitKind::Kg,
                r"\b(\d+(?:[.,]\d+)?)\s*(?:kilos?|kgs?|kilogramos?)\b",
            ),
            (
                UnitKind::G,
                r"\b(\d+(?:[.,]\d+)?)\s*(?:gramos?|g|grs?|gr|grams?)\b",
            ),
            (
                UnitKind::Ml,
                r"\b(\d+(?:[.,]\d+)?)\s*(?:mililitros?|ml|milliliters?)\b",
            ),
            (
                UnitKind::Litro,
                r"\b(\d+(?:[.,]\d+)?)\s*(?:l|lt|lts|litros?)\b",
            ),
            (UnitKind::Unidad, r"\b(\d+)\s*(?:u\.?|unidades?|units?)\b"),
            (UnitKind::Pack, r"\b(?:(\d+)\s*)?packs?\b"),
            (UnitKind::Caja, r"\b(?:(\d+)\s*)?cajas?\b"),
            (UnitKind::Barra, r"\b(?:(\d+)\s*)?barras?\b"),
            (UnitKind::Sobre, r"\b(?:(\d+)\s*)?sobres?\b"),
        ];
        let patterns = table
            .into_iter()
            .map(|(unit, pat)| (unit, Regex::new(pat).expect("unit pattern is valid")))
            .collect();
        Self { patterns }
    }

    /// First pattern in table order that matches the lower-cased name wins.
    /// Returns `None` when nothing matches; the caller escalates that to the
    /// review queue.
    pub fn detect(&self, name: &str) -> Option<UnitMatch> {
        let lowered = name.to_lowercase();
        for (unit, re) in &self.patterns {
            if let Some(caps) = re.captures(&lowered) {
                let matched = caps[0].to_string();
                let value = caps
                    .get(1)
                    .and_then(|m| parse_decimal(m.as_str()))
                    .unwrap_or(CONTAINER_DEFAULT_QUANTITY);
                return Some(UnitMatch {
                    unit: *unit,
                    matched,
                    value,
                });
            }
        }
        None
    }
}

pub(crate) fn parse_decimal(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> UnitTable {
        UnitTable::with_defaults()
    }

    #[test]
    fn extracts_unit_value_and_exact_substring() {
        let m = table().detect("Leche Entera 1,5 Lts La Serenísima").unwrap();
        assert_eq!(m.unit, UnitKind::Litro);
        assert_eq!(m.matched, "1,5 lts");
        assert_eq!(m.value, 1.5);

        let m = table().detect("café molido 0.5 kg").unwrap();
        assert_eq!(m.unit, UnitKind::Kg);
        assert_eq!(m.matched, "0.5 kg");
        assert_eq!(m.value, 0.5);
    }

    #[test]
    fn first_pattern_in_table_order_wins() {
        // "unidades" sits earlier in the table than "pack"
        let m = table().detect("pack 6 unidades gaseosa").unwrap();
        assert_eq!(m.unit, UnitKind::Unidad);
        assert_eq!(m.matched, "6 unidades");
        assert_eq!(m.value, 6.0);
    }

    #[test]
    fn measurement_units_require_an_adjacent_number() {
        assert!(table().detect("harina leudante").is_none());
        // bare "unidad" without a count is not a detection
        assert!(table().detect("precio por unidad").is_none());
    }

    #[test]
    fn container_words_match_without_a_number() {
        let m = table().detect("caja de té en hebras").unwrap();
        assert_eq!(m.unit, UnitKind::Caja);
        assert_eq!(m.matched, "caja");
        assert_eq!(m.value, CONTAINER_DEFAULT_QUANTITY);

        let m = table().detect("turrón 6 barras").unwrap();
        assert_eq!(m.unit, UnitKind::Barra);
        assert_eq!(m.value, 6.0);
    }

    #[test]
    fn gram_abbreviations_match_whole_tokens() {
        let m = table().detect("galletitas surtidas 500 grs").unwrap();
        assert_eq!(m.unit, UnitKind::G);
        assert_eq!(m.matched, "500 grs");

        // "g" must not be clipped out of a longer word, even next to a number
        assert!(table().detect("yerba 100 granel").is_none());
    }

    #[test]
    fn token_lookup_accepts_common_spellings() {
        assert_eq!(UnitKind::from_token(" Kilos "), Some(UnitKind::Kg));
        assert_eq!(UnitKind::from_token("GR"), Some(UnitKind::G));
        assert_eq!(UnitKind::from_token("sobres"), Some(UnitKind::Sobre));
        assert_eq!(UnitKind::from_token("docena"), None);
    }
}
