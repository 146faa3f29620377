//! Key naming for partition locks and checkpoints.

/// Builds the lock and checkpoint keys of a consumer group.
///
/// Workers that share a consumer group share these keys and therefore
/// compete for the same partitions.
#[derive(Debug, Clone)]
pub struct KeyHelper {
    consumer_group: String,
}

impl KeyHelper {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// `checkpoint:{group}-{partition}`
    pub fn checkpoint_key(&self, partition: &str) -> String {
        format!("checkpoint:{}-{}", self.consumer_group, partition)
    }

    /// `lock:{group}-{partition}`
    pub fn lock_key(&self, partition: &str) -> String {
        format!("lock:{}-{}", self.consumer_group, partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let keys = KeyHelper::new("billing");
        assert_eq!(keys.checkpoint_key("shard-3"), "checkpoint:billing-shard-3");
        assert_eq!(keys.lock_key("shard-3"), "lock:billing-shard-3");
        assert_eq!(keys.consumer_group(), "billing");
    }
}
