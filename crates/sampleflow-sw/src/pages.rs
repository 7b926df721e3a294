//! Page-control registry: skip-waiting and claiming of open pages.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// An open page under this origin.
#[derive(Debug, Clone)]
pub struct Page {
    /// Page ID.
    pub id: String,

    /// Page URL.
    pub url: Url,

    /// Generation identifier of the worker controlling this page, if any.
    pub controller: Option<String>,
}

/// Registry of open pages and the staged-rollout override.
#[derive(Debug, Default)]
pub struct PageRegistry {
    pages: HashMap<String, Page>,
    skip_waiting: bool,
}

impl PageRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open page; returns its ID.
    pub fn register(&mut self, url: Url) -> String {
        let id = format!("page-{}", next_page_seq());
        self.pages.insert(
            id.clone(),
            Page {
                id: id.clone(),
                url,
                controller: None,
            },
        );
        id
    }

    /// Get a page by ID.
    pub fn get(&self, id: &str) -> Option<&Page> {
        self.pages.get(id)
    }

    /// Remove a page (closed tab).
    pub fn remove(&mut self, id: &str) -> Option<Page> {
        self.pages.remove(id)
    }

    /// Signal that the installing worker should activate without waiting for
    /// open pages to close.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Check whether skip-waiting was requested.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    /// Take control of all open pages for the given worker generation, so
    /// subsequent requests are intercepted without a reload.
    pub fn claim(&mut self, generation: &str) {
        for page in self.pages.values_mut() {
            page.controller = Some(generation.to_string());
        }
    }

    /// Generation controlling the given page, if any.
    pub fn controlled_by(&self, id: &str) -> Option<&str> {
        self.pages
            .get(id)
            .and_then(|page| page.controller.as_deref())
    }

    /// Number of registered pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

fn next_page_seq() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_url() -> Url {
        Url::parse("https://sampleflow.app/flows").unwrap()
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let mut registry = PageRegistry::new();
        let a = registry.register(page_url());
        let b = registry.register(page_url());

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a).is_some());
    }

    #[test]
    fn test_new_pages_are_uncontrolled() {
        let mut registry = PageRegistry::new();
        let id = registry.register(page_url());
        assert_eq!(registry.controlled_by(&id), None);
    }

    #[test]
    fn test_claim_controls_all_pages() {
        let mut registry = PageRegistry::new();
        let a = registry.register(page_url());
        let b = registry.register(page_url());

        registry.claim("sampleflow-v10");

        assert_eq!(registry.controlled_by(&a), Some("sampleflow-v10"));
        assert_eq!(registry.controlled_by(&b), Some("sampleflow-v10"));
    }

    #[test]
    fn test_claim_overrides_previous_controller() {
        let mut registry = PageRegistry::new();
        let id = registry.register(page_url());

        registry.claim("sampleflow-v9");
        registry.claim("sampleflow-v10");

        assert_eq!(registry.controlled_by(&id), Some("sampleflow-v10"));
    }

    #[test]
    fn test_skip_waiting_flag() {
        let mut registry = PageRegistry::new();
        assert!(!registry.skip_waiting_requested());
        registry.skip_waiting();
        assert!(registry.skip_waiting_requested());
    }

    #[test]
    fn test_remove_page() {
        let mut registry = PageRegistry::new();
        let id = registry.register(page_url());
        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
    }
}
