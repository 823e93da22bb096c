//! Brand alias generation and synonym-set growth.
//!
//! Synonym sets only ever grow, and under the lookup normalization (lower
//! case, accents stripped) they contain no duplicates and never the
//! canonical name itself. Enforcement lives here so every write path shares
//! it.

use itertools::Itertools;
use std::collections::HashSet;

use super::clean::normalize_lookup;

const DEFINITE_ARTICLES: [&str; 4] = ["la", "el", "los", "las"];

/// Basic alias forms for a brand name: the name verbatim, its normalized
/// form, and — when the name starts with a definite article and has more
/// words — the article-stripped form. Order-preserving, deduplicated on the
/// normalized form (so "La Serenísima" and "la serenisima" collapse into
/// the first spelling seen).
pub fn basic_aliases(name: &str) -> Vec<String> {
    let normalized = normalize_lookup(name);
    let mut out: Vec<String> = vec![name.trim().to_string(), normalized.clone()];

    let mut words = normalized.split_whitespace();
    if let Some(first) = words.next() {
        if DEFINITE_ARTICLES.contains(&first) {
            let rest = words.join(" ");
            if !rest.is_empty() {
                out.push(rest);
            }
        }
    }

    out.into_iter()
        .filter(|a| !a.is_empty())
        .unique_by(|a| normalize_lookup(a))
        .collect()
}

/// Merge `additions` into an existing synonym set. A form that normalizes to
/// the canonical name, or to something already present, is skipped. Returns
/// the merged set and how many entries were actually new.
pub fn merge_synonyms(
    canonical: &str,
    existing: &[String],
    additions: &[String],
) -> (Vec<String>, usize) {
    let canonical_key = normalize_lookup(canonical);
    let mut seen: HashSet<String> = existing.iter().map(|s| normalize_lookup(s)).collect();
    let mut merged = existing.to_vec();
    let mut added = 0usize;
    for alias in additions {
        let key = normalize_lookup(alias);
        if key.is_empty() || key == canonical_key || seen.contains(&key) {
            continue;
        }
        seen.insert(key);
        merged.push(alias.trim().to_string());
        added += 1;
    }
    (merged, added)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_verbatim_and_article_stripped_forms() {
        let aliases = basic_aliases("La Serenísima");
        assert_eq!(aliases, vec!["La Serenísima".to_string(), "serenisima".to_string()]);
    }

    #[test]
    fn already_normalized_names_yield_a_single_alias() {
        assert_eq!(basic_aliases("coto"), vec!["coto".to_string()]);
    }

    #[test]
    fn bare_article_is_not_stripped_to_nothing() {
        // single-word names that happen to be articles stay intact
        assert_eq!(basic_aliases("La"), vec!["La".to_string()]);
    }

    #[test]
    fn merge_never_adds_the_canonical_name() {
        let (merged, added) = merge_synonyms(
            "La Serenísima",
            &["serenisima".to_string()],
            &basic_aliases("la serenisima"),
        );
        assert_eq!(added, 0);
        assert_eq!(merged, vec!["serenisima".to_string()]);
    }

    #[test]
    fn merge_is_idempotent() {
        let additions = basic_aliases("Sancor");
        let (first, added_first) = merge_synonyms("SanCor Lácteos", &[], &additions);
        assert_eq!(added_first, 1);
        let (second, added_second) = merge_synonyms("SanCor Lácteos", &first, &additions);
        assert_eq!(added_second, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn merge_dedups_case_and_accent_variants() {
        let (merged, added) = merge_synonyms(
            "Taragüi",
            &[],
            &["TARAGUI".to_string(), "taragüi".to_string(), "taragui hierbas".to_string()],
        );
        // both bare variants normalize to the canonical name; only the
        // longer form survives
        assert_eq!(added, 1);
        assert_eq!(merged, vec!["taragui hierbas".to_string()]);
    }
}
