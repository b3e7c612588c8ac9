// Subscription resolver: the source of tracked (user, exam) pairs

use crate::errors::ResolverError;
use crate::models::TrackedPair;
use async_trait::async_trait;
use std::sync::RwLock;

/// SubscriptionResolver yields the pairs the engine must evaluate.
///
/// The engine only reads from it; which exams a user tracks is decided
/// elsewhere.
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    /// Every tracked pair, with user contact and full exam record
    async fn list_tracked_pairs(&self) -> Result<Vec<TrackedPair>, ResolverError>;

    /// Tracked pairs of a single user
    async fn tracked_pairs_for_user(&self, user_id: i64) -> Result<Vec<TrackedPair>, ResolverError> {
        Ok(self
            .list_tracked_pairs()
            .await?
            .into_iter()
            .filter(|pair| pair.user_id == user_id)
            .collect())
    }
}

/// Resolver over an in-memory list of pairs
#[derive(Debug, Default)]
pub struct StaticSubscriptionResolver {
    pairs: RwLock<Vec<TrackedPair>>,
}

impl StaticSubscriptionResolver {
    pub fn new(pairs: Vec<TrackedPair>) -> Self {
        Self {
            pairs: RwLock::new(pairs),
        }
    }

    /// Add a pair, replacing any existing one for the same (user, exam)
    pub fn subscribe(&self, pair: TrackedPair) {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        pairs.retain(|p| !(p.user_id == pair.user_id && p.exam.id == pair.exam.id));
        pairs.push(pair);
    }

    /// Remove the pair for (user, exam); returns whether one existed
    pub fn unsubscribe(&self, user_id: i64, exam_id: i64) -> bool {
        let mut pairs = self.pairs.write().unwrap_or_else(|e| e.into_inner());
        let before = pairs.len();
        pairs.retain(|p| !(p.user_id == user_id && p.exam.id == exam_id));
        pairs.len() != before
    }
}

#[async_trait]
impl SubscriptionResolver for StaticSubscriptionResolver {
    async fn list_tracked_pairs(&self) -> Result<Vec<TrackedPair>, ResolverError> {
        Ok(self.pairs.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exam;

    fn pair(user_id: i64, exam_id: i64) -> TrackedPair {
        TrackedPair::new(
            user_id,
            format!("user{}@example.com", user_id),
            Exam::new(exam_id, format!("Exam {}", exam_id), "Institution"),
        )
    }

    #[tokio::test]
    async fn test_subscribe_keeps_pairs_unique() {
        let resolver = StaticSubscriptionResolver::new(vec![pair(1, 1)]);
        resolver.subscribe(pair(1, 1));
        resolver.subscribe(pair(1, 2));

        assert_eq!(resolver.list_tracked_pairs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_pair() {
        let resolver = StaticSubscriptionResolver::new(vec![pair(1, 1), pair(2, 1)]);
        assert!(resolver.unsubscribe(1, 1));
        assert!(!resolver.unsubscribe(1, 1));
        assert_eq!(resolver.list_tracked_pairs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pairs_for_user_filters_by_user() {
        let resolver = StaticSubscriptionResolver::new(vec![pair(1, 1), pair(2, 1), pair(1, 3)]);
        let pairs = resolver.tracked_pairs_for_user(1).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.user_id == 1));
    }
}
