use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::product::Product;

/// The product catalog, loaded once at startup from a line-delimited JSON
/// file. Startup fails on the first malformed line: a partially loaded
/// catalog would silently shrink the index.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    products: Vec<Product>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read catalog file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid product record on line {line}: {source}")]
    Parse { line: usize, source: serde_json::Error },
    #[error("duplicate product id `{0}` in catalog")]
    DuplicateId(String),
    #[error("product `{0}` has a negative price")]
    NegativePrice(String),
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogError::Read { path: path.to_path_buf(), source })?;
        Self::parse(&raw)
    }

    pub fn parse(input: &str) -> Result<Self, CatalogError> {
        let mut products = Vec::new();
        let mut seen_ids = BTreeSet::new();

        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let product: Product = serde_json::from_str(line)
                .map_err(|source| CatalogError::Parse { line: index + 1, source })?;

            if product.price < Decimal::ZERO {
                return Err(CatalogError::NegativePrice(product.id.0.clone()));
            }
            if !seen_ids.insert(product.id.0.clone()) {
                return Err(CatalogError::DuplicateId(product.id.0.clone()));
            }
            products.push(product);
        }

        Ok(Self { products })
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{Catalog, CatalogError};

    const SAMPLE: &str = r#"{"id":"p-01","name":"All Day Tumbler","description":"Double-walled tumbler","price":79.0,"capacity_ml":500,"tags":["tumbler"]}
{"id":"p-02","name":"Frozee Cold Cup","description":"Cold cup with straw","price":49.0,"capacity_ml":650,"tags":["cold cup","straw"]}

{"id":"p-03","name":"Buddy Mug","description":"Ceramic mug","price":29.5}
"#;

    #[test]
    fn parses_records_and_skips_blank_lines() {
        let catalog = Catalog::parse(SAMPLE).expect("parse catalog");
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.products()[2].capacity_ml, None);
        assert!(catalog.products()[2].tags.is_empty());
    }

    #[test]
    fn malformed_line_reports_its_line_number() {
        let input = "{\"id\":\"p-01\",\"name\":\"A\",\"description\":\"d\",\"price\":1.0}\nnot json";
        let error = Catalog::parse(input).expect_err("should fail");
        assert!(matches!(error, CatalogError::Parse { line: 2, .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let input = "{\"id\":\"p-01\",\"name\":\"A\",\"description\":\"d\",\"price\":1.0}\n{\"id\":\"p-01\",\"name\":\"B\",\"description\":\"d\",\"price\":2.0}";
        let error = Catalog::parse(input).expect_err("should fail");
        assert!(matches!(error, CatalogError::DuplicateId(id) if id == "p-01"));
    }

    #[test]
    fn negative_prices_are_rejected() {
        let input = "{\"id\":\"p-01\",\"name\":\"A\",\"description\":\"d\",\"price\":-1.0}";
        let error = Catalog::parse(input).expect_err("should fail");
        assert!(matches!(error, CatalogError::NegativePrice(id) if id == "p-01"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("products.jsonl");
        fs::write(&path, SAMPLE).expect("write fixture");

        let catalog = Catalog::load(&path).expect("load catalog");
        assert_eq!(catalog.len(), 3);
        assert!(!catalog.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let error = Catalog::load(std::path::Path::new("/nonexistent/products.jsonl"))
            .expect_err("should fail");
        assert!(matches!(error, CatalogError::Read { .. }));
    }
}
