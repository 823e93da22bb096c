//! Brand resolution: exact word-boundary match, then synonym match, then an
//! embedding-similarity fallback for names with no lexical overlap to any
//! known brand (misspellings, new phrasing).

use anyhow::Result;
use regex::Regex;

use super::clean::normalize_lookup;
use crate::embedding::{cosine, Embedder};

/// Minimum cosine similarity for the semantic fallback to accept a brand.
/// Looser than the product threshold: a wrong brand guess is recoverable
/// through the review queue, a wrong product merge is not.
pub const MIN_BRAND_SIMILARITY: f64 = 0.80;

/// One catalog row, loaded once per batch.
#[derive(Debug, Clone)]
pub struct BrandEntry {
    pub id: i64,
    pub name: String,
    pub synonyms: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrandMatchKind {
    Exact,
    Synonym,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct BrandHit {
    pub brand_id: i64,
    pub canonical_name: String,
    /// The catalog token (canonical name or synonym) found in the input, so
    /// the cleaner can strip exactly what matched. Semantic hits carry none.
    pub matched_token: Option<String>,
    pub kind: BrandMatchKind,
    /// Populated for semantic hits only.
    pub similarity: Option<f64>,
}

/// Whole-word containment on lookup-normalized text.
fn contains_word(haystack: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(token)))
        .expect("escaped token is a valid pattern")
        .is_match(haystack)
}

/// The two free tiers of the cascade: every canonical name first (catalog
/// order), then every synonym. Pure and synchronous.
pub fn resolve_lexical(raw_name: &str, catalog: &[BrandEntry]) -> Option<BrandHit> {
    let input = normalize_lookup(raw_name);
    for brand in catalog {
        if contains_word(&input, &normalize_lookup(&brand.name)) {
            return Some(BrandHit {
                brand_id: brand.id,
                canonical_name: brand.name.clone(),
                matched_token: Some(brand.name.clone()),
                kind: BrandMatchKind::Exact,
                similarity: None,
            });
        }
    }
    for brand in catalog {
        for synonym in &brand.synonyms {
            if contains_word(&input, &normalize_lookup(synonym)) {
                return Some(BrandHit {
                    brand_id: brand.id,
                    canonical_name: brand.name.clone(),
                    matched_token: Some(synonym.clone()),
                    kind: BrandMatchKind::Synonym,
                    similarity: None,
                });
            }
        }
    }
    None
}

/// Full cascade. `Ok(None)` means nothing cleared the bar and the listing
/// should go to review; `Err` means the embedding provider failed after the
/// lexical tiers missed, which callers downgrade to a review entry rather
/// than a batch abort.
pub async fn resolve_brand(
    raw_name: &str,
    catalog: &[BrandEntry],
    embedder: &dyn Embedder,
) -> Result<Option<BrandHit>> {
    if let Some(hit) = resolve_lexical(raw_name, catalog) {
        return Ok(Some(hit));
    }

    if !catalog.iter().any(|b| b.embedding.is_some()) {
        return Ok(None);
    }

    let query = embedder.embed_one(&normalize_lookup(raw_name)).await?;
    let mut best: Option<(&BrandEntry, f64)> = None;
    for brand in catalog {
        let Some(embedding) = &brand.embedding else {
            continue;
        };
        let similarity = cosine(&query, embedding);
        // strictly greater, so the earliest catalog entry wins ties
        if best.as_ref().map_or(true, |(_, s)| similarity > *s) {
            best = Some((brand, similarity));
        }
    }

    Ok(best.and_then(|(brand, similarity)| {
        (similarity >= MIN_BRAND_SIMILARITY).then(|| BrandHit {
            brand_id: brand.id,
            canonical_name: brand.name.clone(),
            matched_token: None,
            kind: BrandMatchKind::Semantic,
            similarity: Some(similarity),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FakeEmbedder;

    fn entry(id: i64, name: &str, synonyms: &[&str], embedding: Option<Vec<f32>>) -> BrandEntry {
        BrandEntry {
            id,
            name: name.to_string(),
            synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
            embedding,
        }
    }

    #[test]
    fn exact_canonical_beats_synonym_of_earlier_brand() {
        let catalog = vec![
            entry(1, "Marolio", &["arcor"], None),
            entry(2, "Arcor", &[], None),
        ];
        let hit = resolve_lexical("galletitas arcor surtidas", &catalog).unwrap();
        assert_eq!(hit.brand_id, 2);
        assert_eq!(hit.kind, BrandMatchKind::Exact);
    }

    #[test]
    fn matches_only_at_word_boundaries() {
        let catalog = vec![entry(1, "Coto", &[], None)];
        assert!(resolve_lexical("cotonetes suaves", &catalog).is_none());
        assert!(resolve_lexical("hamburguesas coto x4", &catalog).is_some());
    }

    #[test]
    fn canonical_match_ignores_case_and_accents() {
        let catalog = vec![entry(1, "La Serenísima", &[], None)];
        let hit = resolve_lexical("leche LA SERENISIMA entera", &catalog).unwrap();
        assert_eq!(hit.canonical_name, "La Serenísima");
    }

    #[test]
    fn synonym_tier_runs_after_every_canonical_name() {
        let catalog = vec![entry(1, "SanCor", &["sancorcito"], None)];
        let hit = resolve_lexical("yogur sancorcito frutilla", &catalog).unwrap();
        assert_eq!(hit.kind, BrandMatchKind::Synonym);
        assert_eq!(hit.brand_id, 1);
        // the matched token is the synonym, not the canonical name, so the
        // cleaner strips what is actually present in the text
        assert_eq!(hit.matched_token.as_deref(), Some("sancorcito"));
    }

    #[tokio::test]
    async fn semantic_fallback_accepts_at_the_threshold() {
        let catalog = vec![entry(1, "Tregar", &[], Some(vec![1.0, 0.0]))];
        let embedder =
            FakeEmbedder::new().with("queso crema tegrar", vec![0.8, 0.6]);
        let hit = resolve_brand("Queso Crema Tegrar", &catalog, &embedder)
            .await
            .unwrap()
            .expect("0.8 is accepted");
        assert_eq!(hit.kind, BrandMatchKind::Semantic);
        assert!(hit.similarity.unwrap() >= MIN_BRAND_SIMILARITY);
    }

    #[tokio::test]
    async fn semantic_fallback_rejects_below_the_threshold() {
        let catalog = vec![entry(1, "Tregar", &[], Some(vec![1.0, 0.0]))];
        let embedder =
            FakeEmbedder::new().with("queso crema tegrar", vec![0.79, 0.613]);
        let hit = resolve_brand("Queso Crema Tegrar", &catalog, &embedder)
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn earliest_brand_wins_a_similarity_tie() {
        let catalog = vec![
            entry(1, "Primero", &[], Some(vec![1.0, 0.0])),
            entry(2, "Segundo", &[], Some(vec![1.0, 0.0])),
        ];
        let embedder = FakeEmbedder::new().with("marca nueva", vec![1.0, 0.0]);
        let hit = resolve_brand("Marca Nueva", &catalog, &embedder)
            .await
            .unwrap()
            .expect("perfect similarity");
        assert_eq!(hit.brand_id, 1);
    }

    #[tokio::test]
    async fn lexical_hit_never_touches_the_embedder() {
        // the fake errors on unknown texts, so a lexical hit must short-circuit
        let catalog = vec![entry(1, "Coto", &[], Some(vec![1.0, 0.0]))];
        let hit = resolve_brand("arvejas coto lata", &catalog, &FakeEmbedder::new())
            .await
            .unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn embedder_failure_surfaces_after_lexical_miss() {
        let catalog = vec![entry(1, "Coto", &[], Some(vec![1.0, 0.0]))];
        let err = resolve_brand("arvejas remolacha", &catalog, &FakeEmbedder::new()).await;
        assert!(err.is_err());
    }
}
