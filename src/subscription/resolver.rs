//! Subscription resolution with in-flight joining.
//!
//! # Responsibilities
//! - Fetch, parse and normalise one subscription into a node set
//! - Guarantee at most one concurrent fetch per subscription id
//! - Persist the node set atomically unless running as a preview

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};

use crate::model::{ModelStore, Node, NodeSource, Subscription};
use crate::observability::metrics;
use crate::subscription::parser::{parse_subscription, ParsedNode};
use crate::subscription::source::SubscriptionSource;
use crate::subscription::SubscriptionError;

/// Result of one fetch, shared by every caller that joined it.
#[derive(Debug)]
pub struct FetchOutcome {
    pub nodes: Vec<Node>,
    /// sha256 hex of the raw body.
    pub body_hash: String,
    pub fetched_at: u64,
}

type Flight = Shared<BoxFuture<'static, Result<Arc<FetchOutcome>, SubscriptionError>>>;

/// Resolves subscriptions into node sets.
pub struct SubscriptionResolver {
    store: Arc<ModelStore>,
    source: Arc<dyn SubscriptionSource>,
    in_flight: Arc<DashMap<String, Flight>>,
}

impl SubscriptionResolver {
    pub fn new(store: Arc<ModelStore>, source: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            store,
            source,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolve one subscription.
    ///
    /// With `preview` the node set is returned without touching the store.
    /// A call made while a fetch for the same id is running joins that fetch.
    pub async fn resolve(&self, id: &str, preview: bool) -> Result<Vec<Node>, SubscriptionError> {
        let result = self.resolve_inner(id, preview).await;
        match &result {
            Ok(nodes) => {
                metrics::record_subscription_resolve("success");
                tracing::info!(subscription = %id, nodes = nodes.len(), preview, "Subscription resolved");
            }
            Err(e) => {
                metrics::record_subscription_resolve(e.kind());
                tracing::warn!(subscription = %id, error = %e, preview, "Subscription resolution failed");
            }
        }
        result
    }

    async fn resolve_inner(&self, id: &str, preview: bool) -> Result<Vec<Node>, SubscriptionError> {
        let snapshot = self.store.snapshot();
        let sub = snapshot
            .subscription(id)
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        if !sub.enabled && !preview {
            return Err(SubscriptionError::Disabled(id.to_string()));
        }

        // The map guard must be released before awaiting.
        let flight = self
            .in_flight
            .entry(id.to_string())
            .or_insert_with(|| self.start_flight(sub.clone()))
            .value()
            .clone();
        let outcome = flight.await?;

        if !preview {
            self.persist(id, &outcome)?;
        }
        Ok(outcome.nodes.clone())
    }

    fn start_flight(&self, sub: Subscription) -> Flight {
        let source = Arc::clone(&self.source);
        let in_flight = Arc::clone(&self.in_flight);
        async move {
            let result = fetch_and_parse(source.as_ref(), &sub).await;
            in_flight.remove(&sub.id);
            result.map(Arc::new)
        }
        .boxed()
        .shared()
    }

    /// Store the outcome once; callers joining the same fetch find it
    /// already recorded.
    fn persist(&self, id: &str, outcome: &FetchOutcome) -> Result<(), SubscriptionError> {
        let snapshot = self.store.snapshot();
        if let Some(sub) = snapshot.subscription(id) {
            if sub.last_hash.as_deref() == Some(outcome.body_hash.as_str())
                && sub.last_fetched_at == Some(outcome.fetched_at)
            {
                return Ok(());
            }
        }
        self.store
            .replace_subscription_nodes(id, outcome.nodes.clone(), outcome.body_hash.clone(), outcome.fetched_at)
            .map(|_| ())
            .map_err(|e| SubscriptionError::Store(e.to_string()))
    }

    /// Refresh every enabled subscription concurrently.
    pub async fn resolve_all(&self) -> BTreeMap<String, Result<usize, SubscriptionError>> {
        let snapshot = self.store.snapshot();
        let ids: Vec<String> = snapshot
            .subscriptions
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone())
            .collect();

        let results = join_all(ids.iter().map(|id| self.resolve(id, false))).await;
        ids.into_iter()
            .zip(results)
            .map(|(id, r)| (id, r.map(|nodes| nodes.len())))
            .collect()
    }
}

async fn fetch_and_parse(source: &dyn SubscriptionSource, sub: &Subscription) -> Result<FetchOutcome, SubscriptionError> {
    let body = source.fetch(&sub.url).await?;
    let body_hash = hex::encode(Sha256::digest(&body));
    let parsed = parse_subscription(&body)?;
    let nodes = into_nodes(&sub.id, parsed);
    if nodes.is_empty() {
        return Err(SubscriptionError::EmptyResult(sub.id.clone()));
    }
    Ok(FetchOutcome {
        nodes,
        body_hash,
        fetched_at: now_unix(),
    })
}

/// Dedupe by identity (first occurrence wins), derive stable ids and make
/// display names unique.
pub fn into_nodes(subscription_id: &str, parsed: Vec<ParsedNode>) -> Vec<Node> {
    let mut seen = HashSet::new();
    let mut name_counts: HashMap<String, usize> = HashMap::new();
    let mut nodes = Vec::with_capacity(parsed.len());

    for entry in parsed {
        let mut node = Node {
            id: String::new(),
            name: entry.name,
            protocol: entry.protocol,
            server: entry.server,
            port: entry.port,
            params: entry.params,
            source: NodeSource::Subscription {
                id: subscription_id.to_string(),
            },
            pinned: false,
            enabled: true,
            tags: Vec::new(),
        };

        let identity = node.identity();
        if !seen.insert(identity.clone()) {
            tracing::debug!(subscription = %subscription_id, identity = %identity, "Dropping duplicate node");
            continue;
        }
        let digest = hex::encode(Sha256::digest(identity.to_string().as_bytes()));
        node.id = format!("{}-{}", subscription_id, &digest[..12]);

        let count = name_counts.entry(node.name.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            node.name = format!("{} #{}", node.name, count);
        }
        nodes.push(node);
    }
    nodes
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn parsed(name: &str, server: &str, port: u16) -> ParsedNode {
        ParsedNode {
            name: name.into(),
            protocol: Protocol::Trojan,
            server: server.into(),
            port,
            params: BTreeMap::new(),
        }
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let nodes = into_nodes(
            "sub",
            vec![
                parsed("A", "a.example.net", 443),
                parsed("A copy", "A.EXAMPLE.NET", 443),
                parsed("B", "a.example.net", 8443),
            ],
        );
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_ids_are_stable_and_prefixed() {
        let a = into_nodes("sub", vec![parsed("A", "a.example.net", 443)]);
        let b = into_nodes("sub", vec![parsed("renamed", "a.example.net", 443)]);
        assert_eq!(a[0].id, b[0].id);
        assert!(a[0].id.starts_with("sub-"));
        assert_eq!(a[0].id.len(), "sub-".len() + 12);
    }

    #[test]
    fn test_duplicate_names_get_suffix() {
        let nodes = into_nodes(
            "sub",
            vec![
                parsed("HK", "1.example.net", 1),
                parsed("HK", "2.example.net", 1),
                parsed("HK", "3.example.net", 1),
            ],
        );
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["HK", "HK #2", "HK #3"]);
    }
}
