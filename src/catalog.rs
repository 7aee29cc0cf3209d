//! Read-only product catalog used to name SKUs in errors and audit rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Display information for a SKU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLabel {
    pub name: String,
    pub variant: Option<String>,
}

impl ProductLabel {
    pub fn display(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{} / {}", self.name, variant),
            None => self.name.clone(),
        }
    }
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn describe(&self, sku: &str) -> Option<ProductLabel>;
}

/// Catalog backed by an in-process map
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<String, ProductLabel>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(self, sku: impl Into<String>, name: impl Into<String>, variant: Option<&str>) -> Self {
        self.insert(sku, name, variant);
        self
    }

    pub fn insert(&self, sku: impl Into<String>, name: impl Into<String>, variant: Option<&str>) {
        let label = ProductLabel {
            name: name.into(),
            variant: variant.map(str::to_string),
        };
        if let Ok(mut products) = self.products.write() {
            products.insert(sku.into(), label);
        }
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn describe(&self, sku: &str) -> Option<ProductLabel> {
        self.products
            .read()
            .ok()
            .and_then(|products| products.get(sku).cloned())
    }
}
