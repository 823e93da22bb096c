//! Name cleaning: case, accents, and word-boundary token removal.
//!
//! Everything here is pure string-in/string-out; detection and persistence
//! live elsewhere.

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Decompose and drop combining marks ("Serenísima" -> "Serenisima").
pub fn strip_accents(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Canonical lookup form: lower-cased, accent-stripped, whitespace collapsed.
/// Used wherever two names must compare case/accent-insensitively.
pub fn normalize_lookup(s: &str) -> String {
    let lowered = strip_accents(&s.to_lowercase());
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove `token` from `text` as a whole word, replacing it with a space.
/// The token is matched literally (regex-escaped) between word boundaries,
/// so removing "la" leaves "lata" intact.
pub fn remove_word(text: &str, token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        return text.to_string();
    }
    let re = Regex::new(&format!(r"\b{}\b", regex::escape(token)))
        .expect("escaped token is a valid pattern");
    re.replace_all(text, " ").into_owned()
}

/// Produce the cleaned display name stored on a canonical product:
/// lower-case, accent-stripped, minus the resolved brand token and the
/// matched unit substring, with everything non-alphanumeric collapsed to
/// single spaces.
pub fn clean_display_name(
    raw: &str,
    unit_substring: Option<&str>,
    brand: Option<&str>,
) -> String {
    let mut name = strip_accents(&raw.to_lowercase());
    if let Some(brand) = brand {
        name = remove_word(&name, &normalize_lookup(brand));
    }
    if let Some(unit) = unit_substring {
        name = remove_word(&name, &strip_accents(&unit.to_lowercase()));
    }
    let scrubbed: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    scrubbed.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_form_drops_case_and_accents() {
        assert_eq!(normalize_lookup("La  Serenísima"), "la serenisima");
        assert_eq!(normalize_lookup("TARAGÜI"), "taragui");
    }

    #[test]
    fn removes_tokens_as_whole_words_only() {
        let out = remove_word("lata de tomate la campagnola", "la");
        // the standalone "la" is gone, the "la" inside "lata" survives
        assert!(out.starts_with("lata de tomate"));
        assert!(!out.contains(" la "));
    }

    #[test]
    fn cleans_brand_and_unit_from_display_name() {
        let out = clean_display_name(
            "Queso Cremoso La Serenísima 500 g",
            Some("500 g"),
            Some("La Serenísima"),
        );
        assert_eq!(out, "queso cremoso");
    }

    #[test]
    fn keeps_words_that_merely_contain_the_brand() {
        let out = clean_display_name("Cotonetes Coto x 100", None, Some("Coto"));
        assert_eq!(out, "cotonetes x 100");
    }

    #[test]
    fn collapses_punctuation_to_single_spaces() {
        let out = clean_display_name("Arroz Gallo (Largo Fino) 1 kg", Some("1 kg"), Some("Gallo"));
        assert_eq!(out, "arroz largo fino");
    }

    #[test]
    fn empty_tokens_are_noops() {
        assert_eq!(remove_word("fideos tallarin", ""), "fideos tallarin");
        assert_eq!(clean_display_name("Fideos Tallarín", None, None), "fideos tallarin");
    }
}
