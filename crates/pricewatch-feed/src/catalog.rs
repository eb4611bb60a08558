//! Catalog tree flattening: turns the retailer's nested category payload into the
//! flat list of category listings the crawl layer has to visit.

use pricewatch_core::ExternalId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPayload {
    #[serde(default)]
    pub categories: Vec<CatalogCategory>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCategory {
    pub id: ExternalId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub section_name: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub redirect_category_id: Option<ExternalId>,
    #[serde(default)]
    pub subcategories: Vec<CatalogCategory>,
}

impl CatalogCategory {
    fn is_listing(&self) -> bool {
        self.layout
            .as_deref()
            .is_some_and(|layout| layout.contains("products") || layout.contains("marketing"))
    }

    fn section(&self) -> &str {
        self.section_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryTarget {
    pub market: String,
    pub id: ExternalId,
    pub name: String,
}

/// Leaf listings below `root`, depth-first in payload order.
///
/// Descends only into subcategories with a products/marketing layout; a node
/// with no such children is itself a target. The redirect id wins over the
/// node's own id.
pub fn flatten_categories(root: &CatalogCategory) -> Vec<(ExternalId, String)> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let children = node
            .subcategories
            .iter()
            .filter(|sub| sub.is_listing())
            .collect::<Vec<_>>();
        if children.is_empty() {
            let id = node.redirect_category_id.clone().unwrap_or_else(|| node.id.clone());
            out.push((id, format_category_name(&node.name)));
        } else {
            stack.extend(children.into_iter().rev());
        }
    }
    out
}

/// Targets for every tracked section of a catalog payload.
pub fn category_targets(payload: &CatalogPayload, tracked_sections: &[String]) -> Vec<CategoryTarget> {
    payload
        .categories
        .iter()
        .filter(|section| tracked_sections.iter().any(|s| s == section.section()))
        .flat_map(|section| {
            let market = section.section().to_string();
            flatten_categories(section)
                .into_iter()
                .map(move |(id, name)| CategoryTarget {
                    market: market.clone(),
                    id,
                    name,
                })
        })
        .collect()
}

/// Lowercased, storefront noise removed, words joined with underscores.
pub fn format_category_name(name: &str) -> String {
    let name = name.to_lowercase().replace('\u{a0}', " ");
    if name.contains("zara") {
        return name.replace("zara", "").trim().to_string();
    }
    if name.contains(" | ") {
        return name.split(" | ").collect::<Vec<_>>().join(" ");
    }
    if name.contains(' ') {
        return name.replace(' ', "_");
    }
    name.replace('-', "_")
}
