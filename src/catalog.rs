//! Catalog walker: pages through the venue's activated topics, reconciles
//! multi-outcome parents with their children, and yields normalized market
//! descriptors.
//!
//! The upstream catalog is messy: entries missing child lists, topic ids
//! reused across chains, activation state that only the detail endpoint
//! knows. One walk tolerates all of it: failed pages yield nothing and the
//! walk continues, repeated "topic not found" responses disable an endpoint
//! for the rest of the walk, and every per-topic lookup is memoized.

use std::collections::HashMap;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::Venue;
use crate::config::Config;
use crate::error::Result;
use crate::payload::{ensure_millis, pick_i64, pick_str};
use crate::types::{MarketStream, MULTI_PARENT};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Detail,
    Multi,
}

/// Consecutive not-found breaker plus per-walk memo for one lookup endpoint.
struct EndpointGuard {
    name: &'static str,
    consecutive_missing: u32,
    stop_after: u32,
    disabled: bool,
    cache: HashMap<String, Option<Value>>,
}

impl EndpointGuard {
    fn new(name: &'static str, stop_after: u32) -> Self {
        Self {
            name,
            consecutive_missing: 0,
            stop_after,
            disabled: false,
            cache: HashMap::new(),
        }
    }
}

/// One catalog walk. Breaker counters and lookup memos live for exactly one
/// walk; the next refresh starts fresh.
pub struct CatalogWalker<'a> {
    venue: &'a dyn Venue,
    cfg: &'a Config,
    detail: EndpointGuard,
    multi: EndpointGuard,
}

impl<'a> CatalogWalker<'a> {
    pub fn new(venue: &'a dyn Venue, cfg: &'a Config) -> Self {
        Self {
            venue,
            cfg,
            detail: EndpointGuard::new("detail", cfg.detail_not_found_stop),
            multi: EndpointGuard::new("multi", cfg.multi_not_found_stop),
        }
    }

    /// Walk the whole catalog and return every emitted descriptor.
    ///
    /// Pages are fetched `page_workers` at a time; entries are reconciled
    /// sequentially in page order. Termination, checked per page: an empty
    /// page, the last page implied by a reported total, or a short page.
    pub async fn walk(&mut self) -> Result<Vec<MarketStream>> {
        let limit = self.cfg.page_size.max(1);
        let workers = self.cfg.page_workers.max(1) as u32;
        let mut out = Vec::new();
        let mut next_page: u32 = 1;
        let mut total_pages: Option<u32> = None;
        let mut stop = false;

        while !stop {
            let mut batch: Vec<u32> = Vec::new();
            for offset in 0..workers {
                let page = next_page + offset;
                if let Some(last) = total_pages {
                    if page > last {
                        break;
                    }
                }
                batch.push(page);
            }
            let Some(&first) = batch.first() else { break };
            let results =
                join_all(batch.iter().map(|&page| self.venue.topic_page(page, limit))).await;
            next_page = first + batch.len() as u32;

            for (&page_no, result) in batch.iter().zip(results.iter()) {
                let payload = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(page = page_no, "catalog page fetch failed: {e}");
                        continue;
                    }
                };

                if total_pages.is_none() {
                    if let Some(total) = pick_i64(payload, &["total", "totalCount", "total_count"])
                    {
                        if total >= 0 {
                            let limit_i64 = limit as i64;
                            total_pages = Some(((total + limit_i64 - 1) / limit_i64) as u32);
                        }
                    }
                }

                let entries = page_entries(payload);
                if entries.is_empty() {
                    stop = true;
                    break;
                }
                for entry in &entries {
                    self.reconcile_entry(entry, &mut out).await;
                }
                if total_pages.is_some_and(|last| page_no >= last) {
                    stop = true;
                    break;
                }
                if (entries.len() as u32) < limit {
                    stop = true;
                    break;
                }
            }
        }

        debug!(
            emitted = out.len(),
            detail_disabled = self.detail.disabled,
            multi_disabled = self.multi.disabled,
            "catalog walk finished"
        );
        Ok(out)
    }

    /// Reconcile one raw list entry, emitting zero or more descriptors.
    async fn reconcile_entry(&mut self, entry: &Value, out: &mut Vec<MarketStream>) {
        let now = self.venue.now_ms().await;
        let topic_id = pick_str(entry, &["topicId", "topic_id"]);

        // Entries without a child list get one shot at the multi endpoint;
        // a payload with children becomes the authoritative parent.
        let mut children = child_list(entry);
        let mut authoritative: Option<Value> = None;
        if children.is_empty() {
            if let Some(tid) = topic_id.as_deref() {
                if let Some(multi) = self.lookup(Endpoint::Multi, tid).await {
                    let multi_children = child_list(&multi);
                    if !multi_children.is_empty() {
                        children = multi_children;
                        authoritative = Some(multi);
                    }
                }
            }
        }

        // The venue reuses topic ids across chains: when the authoritative
        // parent sits on a different chain, the children are its, not the
        // list entry's, and both parents are distinct markets.
        let chains_differ = match &authoritative {
            Some(multi) => pick_i64(multi, &["chainId", "chain_id"])
                != pick_i64(entry, &["chainId", "chain_id"]),
            None => false,
        };
        let entry_is_parent = !children.is_empty() && !chains_differ;

        let mut active = activity(entry, None, now);
        let mut enriched_cutoff: Option<i64> = None;
        if active.is_none() && !entry_is_parent {
            if let Some(tid) = topic_id.as_deref() {
                if let Some(detail) = self.lookup(Endpoint::Detail, tid).await {
                    active = activity(&detail, None, now);
                    enriched_cutoff = cutoff_ms(&detail);
                }
            }
        }

        if entry_is_parent || active == Some(true) {
            if let Some(mut m) = normalize_market(entry, entry_is_parent, None, now) {
                if m.cutoff_at.is_none() {
                    m.cutoff_at = enriched_cutoff;
                }
                out.push(m);
            }
        }

        // Parent the children point at: the authoritative payload when one
        // exists, the entry itself otherwise.
        let auth_parent = authoritative
            .as_ref()
            .and_then(|multi| normalize_market(multi, true, None, now));
        let parent_id = match &auth_parent {
            Some(p) => p.market_id,
            None => match pick_i64(entry, &["marketId", "market_id"])
                .or_else(|| pick_i64(entry, &["topicId", "topic_id"]))
            {
                Some(id) => id,
                None => return,
            },
        };
        if chains_differ {
            if let Some(p) = auth_parent.clone() {
                out.push(p);
            }
        }

        let parent_status = authoritative
            .as_ref()
            .and_then(|v| pick_str(v, &["statusEnum", "status_enum"]))
            .or_else(|| pick_str(entry, &["statusEnum", "status_enum"]));
        for child in &children {
            if activity(child, parent_status.as_deref(), now) == Some(true) {
                if let Some(m) = normalize_market(child, false, Some(parent_id), now) {
                    out.push(m);
                }
            }
        }
    }

    /// Memoized per-topic lookup behind the endpoint's breaker. Successful
    /// fetches reset the consecutive-missing count; only code-10200
    /// responses advance it.
    async fn lookup(&mut self, endpoint: Endpoint, topic_id: &str) -> Option<Value> {
        {
            let guard = self.guard(endpoint);
            if guard.disabled {
                return None;
            }
            if let Some(cached) = guard.cache.get(topic_id) {
                return cached.clone();
            }
        }

        let result = match endpoint {
            Endpoint::Detail => self.venue.topic_detail(topic_id).await,
            Endpoint::Multi => self.venue.multi_detail(topic_id).await,
        };

        let guard = self.guard(endpoint);
        let fetched = match result {
            Ok(v) => {
                guard.consecutive_missing = 0;
                Some(v)
            }
            Err(e) if e.is_topic_not_found() => {
                guard.consecutive_missing += 1;
                if guard.consecutive_missing >= guard.stop_after && !guard.disabled {
                    guard.disabled = true;
                    warn!(
                        endpoint = guard.name,
                        misses = guard.consecutive_missing,
                        "endpoint disabled for the rest of this walk"
                    );
                }
                None
            }
            Err(e) => {
                warn!(endpoint = guard.name, topic_id, "lookup failed: {e}");
                None
            }
        };
        guard.cache.insert(topic_id.to_string(), fetched.clone());
        fetched
    }

    fn guard(&mut self, endpoint: Endpoint) -> &mut EndpointGuard {
        match endpoint {
            Endpoint::Detail => &mut self.detail,
            Endpoint::Multi => &mut self.multi,
        }
    }
}

/// Entries of one listing page: the payload itself when it is an array,
/// else the first array found under the usual container keys.
fn page_entries(payload: &Value) -> Vec<Value> {
    if let Some(items) = payload.as_array() {
        return items.clone();
    }
    for key in ["list", "items", "topics", "records"] {
        if let Some(items) = payload.get(key).and_then(|v| v.as_array()) {
            return items.clone();
        }
    }
    Vec::new()
}

fn child_list(v: &Value) -> Vec<Value> {
    for key in ["childList", "child_list", "children"] {
        if let Some(items) = v.get(key).and_then(|c| c.as_array()) {
            return items.clone();
        }
    }
    Vec::new()
}

fn cutoff_ms(v: &Value) -> Option<i64> {
    pick_i64(v, &["cutoffAt", "cutoff_at"])
        .filter(|&c| c > 0)
        .map(ensure_millis)
}

/// Tri-state activity check. `Some(false)` once resolution or cutoff has
/// passed; otherwise decided by `statusEnum` (numeric `status` fallback,
/// 2 = activated); `None` when no status form is present.
fn activity(v: &Value, status_fallback: Option<&str>, now_ms: i64) -> Option<bool> {
    if let Some(resolved) = pick_i64(v, &["resolvedAt", "resolved_at"]) {
        if resolved > 0 && ensure_millis(resolved) <= now_ms {
            return Some(false);
        }
    }
    if let Some(cutoff) = pick_i64(v, &["cutoffAt", "cutoff_at"]) {
        if cutoff > 0 && ensure_millis(cutoff) <= now_ms {
            return Some(false);
        }
    }
    let status = pick_str(v, &["statusEnum", "status_enum"]);
    if let Some(status) = status.as_deref().or(status_fallback) {
        return Some(status == "Activated");
    }
    if let Some(code) = pick_i64(v, &["status"]) {
        return Some(code == 2);
    }
    None
}

/// Apply the normalization rules to one raw entry. Returns `None` for
/// entries that cannot satisfy the descriptor invariant (no market id, or
/// no token on a non-parent).
fn normalize_market(
    v: &Value,
    has_children: bool,
    parent_market_id: Option<i64>,
    updated_at: i64,
) -> Option<MarketStream> {
    let market_id =
        pick_i64(v, &["marketId", "market_id"]).or_else(|| pick_i64(v, &["topicId", "topic_id"]))?;

    let market_type = if has_children {
        Some(MULTI_PARENT)
    } else {
        pick_i64(v, &["marketType", "market_type"])
            .or_else(|| pick_i64(v, &["topicType", "topic_type"]))
    };

    let yes_token_id = match pick_str(v, &["yesTokenId", "yes_token_id", "yesPos", "yes_pos"]) {
        Some(token) => token,
        None if market_type == Some(MULTI_PARENT) => MarketStream::synthetic_token(market_id),
        None => return None,
    };

    let title = pick_str(v, &["marketTitle", "market_title", "title"])
        .unwrap_or_else(|| format!("market-{market_id}"));
    let topic_id =
        pick_str(v, &["topicId", "topic_id"]).unwrap_or_else(|| market_id.to_string());

    Some(MarketStream {
        market_id,
        yes_token_id,
        title,
        parent_market_id,
        topic_id,
        market_type,
        chain_id: pick_i64(v, &["chainId", "chain_id"]),
        cutoff_at: cutoff_ms(v),
        updated_at,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
