//! 📇 Watchlist subscription manager.
//!
//! Addresses arrive from labeled sources (pinned registry, legacy imports,
//! alpha pool, custom). An address is subscribed iff at least one source
//! names it. Transport assignment: every pinned address rides a websocket,
//! then remaining websocket slots (default 40) fill in source-priority
//! order; everything else is polled. A pinned address can never be demoted
//! to polling.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceLabel {
    /// Pinned registry; always websocket.
    Pinned,
    /// Pre-pool legacy imports.
    Legacy,
    /// Current alpha-pool membership.
    AlphaPool,
    /// Operator one-offs.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Websocket,
    Polling,
}

/// The full transport plan for the current watchlist.
pub type TransportPlan = BTreeMap<String, Transport>;

pub struct SubscriptionManager {
    // BTreeMap keeps plan computation deterministic.
    entries: RwLock<BTreeMap<String, BTreeSet<SourceLabel>>>,
    websocket_slots: usize,
}

impl SubscriptionManager {
    pub fn new(websocket_slots: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            websocket_slots,
        }
    }

    pub fn register(&self, address: &str, source: SourceLabel) {
        self.entries
            .write()
            .entry(address.to_lowercase())
            .or_default()
            .insert(source);
    }

    /// Remove one source; the address stays subscribed while any other
    /// source still names it.
    pub fn unregister(&self, address: &str, source: SourceLabel) {
        let mut entries = self.entries.write();
        let address = address.to_lowercase();
        if let Some(sources) = entries.get_mut(&address) {
            sources.remove(&source);
            if sources.is_empty() {
                entries.remove(&address);
            }
        }
    }

    /// Replace every address registered under `source` with `addresses`.
    /// Used by the periodic watchlist sync (pinned table, alpha pool).
    pub fn sync_source(&self, source: SourceLabel, addresses: &[String]) {
        let mut entries = self.entries.write();
        let wanted: BTreeSet<String> = addresses.iter().map(|a| a.to_lowercase()).collect();

        entries.retain(|addr, sources| {
            if !wanted.contains(addr) {
                sources.remove(&source);
            }
            !sources.is_empty()
        });
        for addr in wanted {
            entries.entry(addr).or_default().insert(source);
        }
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.entries.read().contains_key(&address.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute the transport for every subscribed address.
    pub fn transport_plan(&self) -> TransportPlan {
        let entries = self.entries.read();
        let mut plan = TransportPlan::new();

        // Pinned addresses take slots unconditionally (and may exceed the
        // ceiling; the ceiling binds the rest).
        let mut used_slots = 0usize;
        for (addr, sources) in entries.iter() {
            if sources.contains(&SourceLabel::Pinned) {
                plan.insert(addr.clone(), Transport::Websocket);
                used_slots += 1;
            }
        }

        // Remaining addresses in source-priority order: alpha pool, then
        // custom, then legacy.
        for priority in [SourceLabel::AlphaPool, SourceLabel::Custom, SourceLabel::Legacy] {
            for (addr, sources) in entries.iter() {
                if plan.contains_key(addr) || !sources.contains(&priority) {
                    continue;
                }
                let transport = if used_slots < self.websocket_slots {
                    used_slots += 1;
                    Transport::Websocket
                } else {
                    Transport::Polling
                };
                plan.insert(addr.clone(), transport);
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_subscribed_while_any_source_names_it() {
        let mgr = SubscriptionManager::new(40);
        mgr.register("0xAA", SourceLabel::AlphaPool);
        mgr.register("0xaa", SourceLabel::Custom);
        assert!(mgr.is_subscribed("0xAA"));

        mgr.unregister("0xaa", SourceLabel::AlphaPool);
        assert!(mgr.is_subscribed("0xaa"));
        mgr.unregister("0xaa", SourceLabel::Custom);
        assert!(!mgr.is_subscribed("0xaa"));
    }

    #[test]
    fn pinned_always_websocket_even_over_ceiling() {
        let mgr = SubscriptionManager::new(2);
        for i in 0..4 {
            mgr.register(&format!("0xpin{i}"), SourceLabel::Pinned);
        }
        let plan = mgr.transport_plan();
        assert!(plan.values().all(|t| *t == Transport::Websocket));
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn ceiling_demotes_overflow_to_polling() {
        let mgr = SubscriptionManager::new(3);
        mgr.register("0xpin", SourceLabel::Pinned);
        for i in 0..5 {
            mgr.register(&format!("0xpool{i}"), SourceLabel::AlphaPool);
        }
        let plan = mgr.transport_plan();

        assert_eq!(plan["0xpin"], Transport::Websocket);
        let ws = plan.values().filter(|t| **t == Transport::Websocket).count();
        let polled = plan.values().filter(|t| **t == Transport::Polling).count();
        assert_eq!(ws, 3);
        assert_eq!(polled, 3);
    }

    #[test]
    fn sync_source_replaces_membership() {
        let mgr = SubscriptionManager::new(40);
        mgr.sync_source(SourceLabel::AlphaPool, &["0xa".into(), "0xb".into()]);
        assert_eq!(mgr.len(), 2);

        mgr.sync_source(SourceLabel::AlphaPool, &["0xb".into(), "0xc".into()]);
        assert!(!mgr.is_subscribed("0xa"));
        assert!(mgr.is_subscribed("0xb"));
        assert!(mgr.is_subscribed("0xc"));
    }

    #[test]
    fn sync_does_not_strip_other_sources() {
        let mgr = SubscriptionManager::new(40);
        mgr.register("0xa", SourceLabel::Pinned);
        mgr.sync_source(SourceLabel::AlphaPool, &["0xa".into()]);
        mgr.sync_source(SourceLabel::AlphaPool, &[]);
        // Still pinned.
        assert!(mgr.is_subscribed("0xa"));
        assert_eq!(mgr.transport_plan()["0xa"], Transport::Websocket);
    }
}
