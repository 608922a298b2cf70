//! Query subscriptions.
//!
//! A subscription computes its initial result inside a transaction, then
//! re-evaluates whenever a commit touches the subscribed collection.
//! Results are delivered on a dedicated thread in commit order; variables
//! are snapshotted at subscribe time. Unsubscribing is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;
use trellis_core::{CollectionDef, Variables};

use crate::error::DbError;
use crate::query::{run_query, Query};
use crate::store::TripleStore;

/// Live subscription handle. Dropping it does not cancel; call
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    store: Arc<TripleStore>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    /// Close the notification channel. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.store.remove_subscriber(self.id);
            debug!(id = self.id, "subscription closed");
        }
    }
}

pub(crate) fn spawn_subscription(
    store: Arc<TripleStore>,
    query: Query,
    def: Option<CollectionDef>,
    vars: Variables,
    on_results: impl Fn(Vec<serde_json::Value>) + Send + 'static,
    on_error: impl Fn(DbError) + Send + 'static,
) -> Subscription {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let id = store.register_subscriber(sender);
    let cancelled = Arc::new(AtomicBool::new(false));

    let handle = Subscription {
        id,
        store: Arc::clone(&store),
        cancelled: Arc::clone(&cancelled),
    };

    std::thread::spawn(move || {
        let fetch = || {
            store.transact(None, |tx| run_query(tx, &query, def.as_ref(), &vars))
        };

        let mut last = match fetch() {
            Ok(results) => {
                on_results(results.clone());
                Some(results)
            }
            Err(err) => {
                on_error(err);
                None
            }
        };

        while let Ok(note) = receiver.recv() {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            if !note.collections.contains(&query.collection) {
                continue;
            }
            match fetch() {
                Ok(results) => {
                    if last.as_ref() != Some(&results) {
                        on_results(results.clone());
                        last = Some(results);
                    }
                }
                Err(err) => on_error(err),
            }
        }
        debug!(id, "subscription loop ended");
    });

    handle
}
