use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use kopi_core::{Catalog, Product, ToolError};

use crate::embedding::Embedder;

pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_TOP_K: usize = 20;

/// Secondary deterministic orderings a query can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Cheapest,
    MostExpensive,
    Largest,
    Smallest,
}

impl SortKey {
    /// First matching keyword set wins; no match means no re-sort.
    pub fn detect(query: &str) -> Option<Self> {
        let lowered = query.to_lowercase();
        const SETS: &[(SortKey, &[&str])] = &[
            (SortKey::Cheapest, &["cheapest", "lowest price", "budget"]),
            (SortKey::MostExpensive, &["most expensive", "premium", "highest price"]),
            (SortKey::Largest, &["largest", "biggest", "most capacity"]),
            (SortKey::Smallest, &["smallest", "smallest capacity"]),
        ];
        for (key, phrases) in SETS {
            if phrases.iter().any(|phrase| lowered.contains(phrase)) {
                return Some(*key);
            }
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cheapest => "cheapest",
            Self::MostExpensive => "most_expensive",
            Self::Largest => "largest",
            Self::Smallest => "smallest",
        }
    }
}

/// Immutable semantic index over the catalog. Built once at startup; reads
/// are lock-free afterwards. Exclusively owns the embedding store.
pub struct ProductIndex {
    products: Vec<Product>,
    embeddings: Vec<Vec<f32>>,
    embedder: Arc<dyn Embedder>,
}

impl ProductIndex {
    /// Embeds the whole catalog. Failure here is fatal: the process should
    /// not come up with a partially searchable catalog.
    pub async fn build(catalog: &Catalog, embedder: Arc<dyn Embedder>) -> Result<Self, ToolError> {
        let texts: Vec<String> =
            catalog.products().iter().map(Product::searchable_text).collect();
        let mut embeddings = embedder.embed_batch(&texts).await?;

        let expected = embedder.dimension();
        for vector in &mut embeddings {
            if vector.len() != expected {
                return Err(ToolError::Embedding(format!(
                    "catalog embedding has dimension {}, expected {expected}",
                    vector.len()
                )));
            }
            normalize(vector);
        }

        Ok(Self { products: catalog.products().to_vec(), embeddings, embedder })
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Top-k products by cosine similarity, ties broken by product id so
    /// results are stable across invocations. An embedding failure is
    /// non-fatal: callers treat the empty list as "no matches".
    pub async fn search(&self, query: &str, k: usize) -> Vec<(Product, f32)> {
        let k = k.min(MAX_TOP_K);
        if k == 0 || self.products.is_empty() {
            return Vec::new();
        }

        let mut query_vector = match self.embedder.embed(query).await {
            Ok(vector) if vector.len() == self.embedder.dimension() => vector,
            Ok(vector) => {
                warn!(
                    expected = self.embedder.dimension(),
                    received = vector.len(),
                    "query embedding has the wrong dimension; returning no matches"
                );
                return Vec::new();
            }
            Err(error) => {
                warn!(error = %error, "query embedding failed; returning no matches");
                return Vec::new();
            }
        };
        normalize(&mut query_vector);

        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(index, embedding)| (index, dot(embedding, &query_vector)))
            .collect();
        scored.sort_by(|(left_index, left_score), (right_index, right_score)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| self.products[*left_index].id.cmp(&self.products[*right_index].id))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(index, score)| (self.products[index].clone(), score))
            .collect()
    }

    /// `search` plus a deterministic secondary sort when the query asks for
    /// one. Unknown capacities order last for the capacity keys.
    pub async fn search_sorted(
        &self,
        query: &str,
        k: usize,
        sort_key: Option<SortKey>,
    ) -> Vec<(Product, f32)> {
        let mut results = self.search(query, k).await;
        let Some(sort_key) = sort_key else {
            return results;
        };

        results.sort_by(|(left, _), (right, _)| {
            let ordering = match sort_key {
                SortKey::Cheapest => left.price.cmp(&right.price),
                SortKey::MostExpensive => right.price.cmp(&left.price),
                SortKey::Largest => match (left.capacity_ml, right.capacity_ml) {
                    (Some(a), Some(b)) => b.cmp(&a),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                },
                SortKey::Smallest => match (left.capacity_ml, right.capacity_ml) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                },
            };
            ordering.then_with(|| left.id.cmp(&right.id))
        });
        results
    }

    /// Context block handed to the language model.
    pub fn format_results(results: &[(Product, f32)], sort_key: Option<SortKey>) -> String {
        if results.is_empty() {
            return "No products found matching your query.".to_string();
        }

        let mut intro = format!("We have {} drinkware products available", results.len());
        if let Some(key) = sort_key {
            intro.push_str(match key {
                SortKey::Cheapest => " (sorted by price, cheapest first)",
                SortKey::MostExpensive => " (sorted by price, highest first)",
                SortKey::Largest => " (sorted by capacity, largest first)",
                SortKey::Smallest => " (sorted by capacity, smallest first)",
            });
        }
        intro.push_str(":\n\n");

        let lines: Vec<String> = results
            .iter()
            .enumerate()
            .map(|(index, (product, _))| format!("{}. {}", index + 1, product.summary_line()))
            .collect();
        intro + &lines.join("\n")
    }
}

fn normalize(vector: &mut [f32]) {
    let magnitude = vector.iter().map(|component| component * component).sum::<f32>().sqrt();
    if magnitude > f32::EPSILON {
        for component in vector.iter_mut() {
            *component /= magnitude;
        }
    }
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use kopi_core::{Catalog, ToolError};
    use rust_decimal::Decimal;

    use crate::embedding::{Embedder, HashingEmbedder};

    use super::{ProductIndex, SortKey, DEFAULT_TOP_K};

    const CATALOG: &str = r#"{"id":"p-01","name":"All Day Tumbler","description":"Double-walled stainless steel tumbler for hot drinks","price":79.0,"capacity_ml":500,"tags":["tumbler","hot"]}
{"id":"p-02","name":"Frozee Cold Cup","description":"Cold cup tumbler with straw","price":49.0,"capacity_ml":650,"tags":["cold cup","straw"]}
{"id":"p-03","name":"Buddy Mug","description":"Ceramic mug for coffee","price":29.5,"tags":["mug"]}
{"id":"p-04","name":"Trail Bottle","description":"Leakproof water bottle","price":59.0,"capacity_ml":1000,"tags":["bottle"]}
"#;

    async fn index() -> ProductIndex {
        let catalog = Catalog::parse(CATALOG).expect("catalog");
        ProductIndex::build(&catalog, Arc::new(HashingEmbedder::new(128)))
            .await
            .expect("build index")
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn dimension(&self) -> usize {
            8
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ToolError> {
            Err(ToolError::Embedding("upstream offline".to_string()))
        }
    }

    #[tokio::test]
    async fn search_ranks_vocabulary_overlap_first() {
        let index = index().await;
        let results = index.search("stainless steel tumbler", DEFAULT_TOP_K).await;

        assert!(!results.is_empty());
        assert_eq!(results[0].0.id.0, "p-01");
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1, "scores must be non-increasing");
        }
    }

    #[tokio::test]
    async fn search_is_deterministic_across_invocations() {
        let index = index().await;
        let first: Vec<String> =
            index.search("tumbler", 4).await.into_iter().map(|(p, _)| p.id.0).collect();
        let second: Vec<String> =
            index.search("tumbler", 4).await.into_iter().map(|(p, _)| p.id.0).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn k_zero_returns_empty_without_error() {
        let index = index().await;
        assert!(index.search("tumbler", 0).await.is_empty());
    }

    #[tokio::test]
    async fn k_is_capped_at_twenty() {
        let index = index().await;
        let results = index.search("tumbler", 500).await;
        assert!(results.len() <= 20);
    }

    #[tokio::test]
    async fn empty_catalog_searches_empty() {
        let catalog = Catalog::parse("").expect("empty catalog");
        let index = ProductIndex::build(&catalog, Arc::new(HashingEmbedder::new(16)))
            .await
            .expect("build");
        assert!(index.is_empty());
        assert!(index.search("tumbler", 5).await.is_empty());
    }

    #[tokio::test]
    async fn query_embedding_failure_degrades_to_no_matches() {
        let catalog = Catalog::parse("").expect("empty catalog");
        let index =
            ProductIndex::build(&catalog, Arc::new(FailingEmbedder)).await.expect("build empty");
        assert!(index.search("tumbler", 5).await.is_empty());
    }

    #[tokio::test]
    async fn cheapest_sort_is_non_decreasing_in_price() {
        let index = index().await;
        let results =
            index.search_sorted("budget tumbler", 4, Some(SortKey::Cheapest)).await;

        let prices: Vec<Decimal> = results.iter().map(|(p, _)| p.price).collect();
        let mut sorted = prices.clone();
        sorted.sort();
        assert_eq!(prices, sorted, "cheapest ordering must be non-decreasing");
    }

    #[tokio::test]
    async fn capacity_sorts_put_unknowns_last() {
        let index = index().await;
        let results = index.search_sorted("tumbler mug bottle", 4, Some(SortKey::Largest)).await;

        let capacities: Vec<Option<u32>> =
            results.iter().map(|(p, _)| p.capacity_ml).collect();
        let known: Vec<u32> = capacities.iter().flatten().copied().collect();
        let mut known_sorted = known.clone();
        known_sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(known, known_sorted);
        if capacities.contains(&None) {
            assert_eq!(capacities.last(), Some(&None), "unknown capacity must sort last");
        }
    }

    #[test]
    fn sort_key_detection_first_match_wins() {
        assert_eq!(SortKey::detect("cheapest tumbler"), Some(SortKey::Cheapest));
        assert_eq!(SortKey::detect("any budget options?"), Some(SortKey::Cheapest));
        assert_eq!(SortKey::detect("most expensive premium cup"), Some(SortKey::MostExpensive));
        assert_eq!(SortKey::detect("biggest bottle you have"), Some(SortKey::Largest));
        assert_eq!(SortKey::detect("smallest capacity cup"), Some(SortKey::Smallest));
        assert_eq!(SortKey::detect("show me tumblers"), None);
    }

    #[test]
    fn formatted_block_numbers_results() {
        let catalog = Catalog::parse(CATALOG).expect("catalog");
        let results: Vec<_> =
            catalog.products().iter().cloned().map(|product| (product, 0.5f32)).collect();
        let block = ProductIndex::format_results(&results[..2], Some(SortKey::Cheapest));

        assert!(block.starts_with("We have 2 drinkware products available (sorted by price"));
        assert!(block.contains("1. All Day Tumbler"));
        assert!(block.contains("2. Frozee Cold Cup"));
        assert_eq!(
            ProductIndex::format_results(&[], None),
            "No products found matching your query."
        );
    }
}
