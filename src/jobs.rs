// src/jobs.rs
//! Background jobs. Keyword embeddings are computed lazily: subscriptions
//! are created without one, and this job fills them in so the semantic stage
//! can start scoring. Failures are logged and retried on the next tick.

use metrics::counter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::embedding::EmbeddingProvider;
use crate::store::SubscriptionStore;

const BACKFILL_BATCH: i64 = 16;

pub fn spawn_embedding_backfill(
    store: Arc<dyn SubscriptionStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let pending = match store.subscriptions_missing_embedding(BACKFILL_BATCH).await {
                Ok(subs) => subs,
                Err(e) => {
                    warn!(target: "jobs", error = %e, "embedding backfill scan failed");
                    continue;
                }
            };
            if pending.is_empty() {
                continue;
            }

            let mut filled = 0usize;
            for sub in pending {
                match embedder.embed(&sub.query_text()).await {
                    Ok(vector) => match store.store_keyword_embedding(sub.id, &vector).await {
                        Ok(()) => filled += 1,
                        Err(e) => {
                            warn!(
                                target: "jobs",
                                subscription_id = sub.id,
                                error = %e,
                                "failed to persist keyword embedding"
                            );
                        }
                    },
                    Err(e) => {
                        warn!(
                            target: "jobs",
                            subscription_id = sub.id,
                            error = %e,
                            "keyword embedding failed, will retry next tick"
                        );
                    }
                }
            }

            if filled > 0 {
                counter!("keyword_embeddings_backfilled_total").increment(filled as u64);
                info!(target: "jobs", filled, "embedding backfill tick");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::store::{MemoryStore, NewSubscription, SubscriptionStore};

    #[tokio::test]
    async fn backfill_fills_missing_embeddings_and_skips_failures() {
        let store = Arc::new(MemoryStore::new());
        let embedder = Arc::new(MockEmbedder::new(2));

        let a = store
            .insert_subscription(NewSubscription {
                user_id: 1,
                group_id: -1,
                positive_keywords: vec!["велосипед".into()],
                negative_keywords: vec![],
            })
            .await
            .unwrap();
        let b = store
            .insert_subscription(NewSubscription {
                user_id: 2,
                group_id: -1,
                positive_keywords: vec!["квартира".into()],
                negative_keywords: vec![],
            })
            .await
            .unwrap();
        // only subscription `a` has a vector available
        embedder.insert(&a.query_text(), vec![1.0, 0.0]);

        // one manual tick worth of work, without the timer
        let pending = store.subscriptions_missing_embedding(16).await.unwrap();
        assert_eq!(pending.len(), 2);
        for sub in pending {
            if let Ok(v) = embedder.embed(&sub.query_text()).await {
                store.store_keyword_embedding(sub.id, &v).await.unwrap();
            }
        }

        let a_after = store.get_subscription(a.id).await.unwrap().unwrap();
        let b_after = store.get_subscription(b.id).await.unwrap().unwrap();
        assert_eq!(a_after.keyword_embedding, Some(vec![1.0, 0.0]));
        assert!(b_after.keyword_embedding.is_none());
    }
}
