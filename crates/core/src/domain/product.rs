use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A catalog entry. Loaded once at startup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    #[serde(default)]
    pub capacity_ml: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Product {
    /// Text handed to the embedder when the index is built.
    pub fn searchable_text(&self) -> String {
        let mut text = format!("{} {}", self.name, self.description);
        if let Some(capacity) = self.capacity_ml {
            text.push_str(&format!(" {capacity}ml"));
        }
        if !self.tags.is_empty() {
            text.push(' ');
            text.push_str(&self.tags.join(" "));
        }
        text
    }

    /// One-line rendering used in prompt context blocks.
    pub fn summary_line(&self) -> String {
        let mut parts = vec![self.name.clone()];
        parts.push(format!("Price: RM{}", self.price));
        if let Some(capacity) = self.capacity_ml {
            parts.push(format!("Capacity: {capacity}ml"));
        }
        parts.join(" | ")
    }
}
