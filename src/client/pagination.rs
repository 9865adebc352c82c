//! Offset-based pagination over listing endpoints.
//!
//! The platform's listing endpoints accept `limit`/`offset` query parameters
//! but differ in response shape: some return a bare array, others wrap the
//! page in an `items`/`data`/`results` field, and a few use endpoint-specific
//! keys (`/feedback` returns `feedback`). The driver adapts all of them and
//! guards against servers that keep replaying the same page: every yielded
//! item's ID is remembered and a page that contributes nothing new ends the
//! iteration. A hard page ceiling bounds any remaining runaway.

use std::collections::HashSet;

use serde_json::Value;

use super::ApiClient;
use crate::errors::MigrateError;

/// Hard ceiling on pages fetched per listing.
pub const MAX_PAGES: u32 = 10_000;

/// Pull the page items out of a decoded response body.
///
/// `extra_key` lets a caller name an endpoint-specific wrapper field that is
/// checked before the common ones. Unrecognized object shapes degrade to a
/// single-element page.
pub fn extract_items(body: &Value, extra_key: Option<&str>) -> Vec<Value> {
    match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            let keys = extra_key
                .into_iter()
                .chain(["items", "data", "results"]);
            for key in keys {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.clone();
                }
            }
            vec![body.clone()]
        }
        _ => Vec::new(),
    }
}

/// The duplicate-guard identity of an item: `id`, `_id`, or `uuid`.
pub fn item_id(item: &Value) -> Option<String> {
    for key in ["id", "_id", "uuid"] {
        if let Some(id) = item.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

/// Lazy pull-based iterator over a paginated listing.
///
/// Each `next_page` call issues one GET and returns the page's previously
/// unseen items. Iteration terminates on an empty page, a short page, a page
/// of already-seen IDs, or the page ceiling.
pub struct Paginator<'a> {
    client: &'a ApiClient,
    path: String,
    query: Vec<(String, String)>,
    page_size: usize,
    items_key: Option<&'static str>,
    offset: usize,
    seen: HashSet<String>,
    pages: u32,
    done: bool,
}

impl<'a> Paginator<'a> {
    pub(crate) fn new(
        client: &'a ApiClient,
        path: &str,
        query: Vec<(String, String)>,
        page_size: usize,
    ) -> Self {
        Self {
            client,
            path: path.to_string(),
            query,
            page_size,
            items_key: None,
            offset: 0,
            seen: HashSet::new(),
            pages: 0,
            done: false,
        }
    }

    /// Name an endpoint-specific wrapper field for the page items.
    pub fn with_items_key(mut self, key: &'static str) -> Self {
        self.items_key = Some(key);
        self
    }

    /// Fetch the next page, returning its new items, or `None` when the
    /// listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, MigrateError> {
        if self.done {
            return Ok(None);
        }
        if self.pages >= MAX_PAGES {
            tracing::warn!(
                "pagination of {} stopped at the {}-page ceiling",
                self.path,
                MAX_PAGES
            );
            self.done = true;
            return Ok(None);
        }
        self.pages += 1;

        let mut query: Vec<(&str, String)> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        query.push(("limit", self.page_size.to_string()));
        query.push(("offset", self.offset.to_string()));

        let body = match self.client.get(&self.path, &query).await {
            Ok(body) => body,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };

        let items = extract_items(&body, self.items_key);
        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        let mut fresh = Vec::new();
        for item in &items {
            match item_id(item) {
                Some(id) => {
                    if self.seen.insert(id) {
                        fresh.push(item.clone());
                    }
                }
                None => fresh.push(item.clone()),
            }
        }

        // A page of nothing but replays means the server is not honoring the
        // offset; stop rather than loop.
        if fresh.is_empty() {
            self.done = true;
            return Ok(None);
        }

        if items.len() < self.page_size {
            self.done = true;
        }
        self.offset += items.len();

        Ok(Some(fresh))
    }

    /// Drain the listing into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>, MigrateError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
