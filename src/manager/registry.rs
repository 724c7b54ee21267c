/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use crate::manager::group::TopicConsumerGroup;
use crate::partition::PartitionConsumer;
use crate::types::PartitionId;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything registered under one topic name.
#[derive(Debug, Default)]
pub(crate) struct TopicSlot {
    /// Set once the slot has been removed from the registry; a slot in this
    /// state must not receive new registrations.
    retired: bool,
    pub group: Option<TopicConsumerGroup>,
    pub singles: BTreeMap<PartitionId, Arc<PartitionConsumer>>,
}

impl TopicSlot {
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.singles.contains_key(&partition)
            || self
                .group
                .as_ref()
                .is_some_and(|group| group.get(partition).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.group.as_ref().is_none_or(TopicConsumerGroup::is_empty)
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: BTreeSet<PartitionId> = self.singles.keys().copied().collect();
        if let Some(group) = &self.group {
            partitions.extend(group.partitions());
        }
        partitions.into_iter().collect()
    }

    pub fn find(&self, partition: PartitionId) -> Option<Arc<PartitionConsumer>> {
        self.singles.get(&partition).cloned().or_else(|| {
            self.group
                .as_ref()
                .and_then(|group| group.get(partition).cloned())
        })
    }

    /// Drops consumers that finished, failed or were cancelled while registered.
    fn remove_closed(&mut self) {
        self.singles.retain(|_, consumer| !consumer.is_closed());
        if let Some(group) = self.group.as_mut() {
            group.remove_closed();
            if group.is_empty() {
                self.group = None;
            }
        }
    }

    fn take_all(&mut self) -> Vec<Arc<PartitionConsumer>> {
        let mut consumers: Vec<_> = std::mem::take(&mut self.singles).into_values().collect();
        if let Some(group) = self.group.take() {
            consumers.extend(group.partitions().into_iter().filter_map(|p| group.get(p).cloned()));
        }
        consumers
    }
}

/// Exclusive access to one topic's slot.
pub(crate) struct SlotGuard {
    topic: String,
    slot: Arc<Mutex<TopicSlot>>,
    guard: OwnedMutexGuard<TopicSlot>,
}

impl Deref for SlotGuard {
    type Target = TopicSlot;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for SlotGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Registry of consumers keyed by topic, and within a topic by partition.
///
/// Every topic has its own lock, so subscribing and stopping the same topic
/// are serialized while different topics never wait on each other. Closed
/// consumers are unregistered whenever their topic is locked.
#[derive(Debug, Default)]
pub(crate) struct TopicRegistry {
    topics: DashMap<String, Arc<Mutex<TopicSlot>>>,
}

impl TopicRegistry {
    /// Locks the slot of `topic`, creating it when missing.
    pub async fn lock(&self, topic: &str) -> SlotGuard {
        loop {
            let slot = self
                .topics
                .entry(topic.to_owned())
                .or_default()
                .value()
                .clone();
            let mut guard = slot.clone().lock_owned().await;
            if !guard.retired {
                guard.remove_closed();
                return SlotGuard {
                    topic: topic.to_owned(),
                    slot,
                    guard,
                };
            }
        }
    }

    /// Locks the slot of `topic` if anything is registered under it.
    pub async fn lock_existing(&self, topic: &str) -> Option<SlotGuard> {
        let slot = self.topics.get(topic).map(|entry| entry.value().clone())?;
        let guard = slot.clone().lock_owned().await;
        if guard.retired {
            return None;
        }
        let mut guard = SlotGuard {
            topic: topic.to_owned(),
            slot,
            guard,
        };
        guard.remove_closed();
        if guard.is_empty() {
            self.retire(&mut guard);
            return None;
        }
        Some(guard)
    }

    /// Unregisters the closed consumers of `topic`.
    pub async fn prune(&self, topic: &str) {
        drop(self.lock_existing(topic).await);
    }

    /// Removes the slot from the registry if nothing is registered in it anymore.
    pub fn release(&self, mut guard: SlotGuard) {
        if guard.is_empty() {
            self.retire(&mut guard);
        }
    }

    /// Unregisters everything under `topic` and returns the consumers that were registered.
    pub async fn remove_topic(&self, topic: &str) -> Vec<Arc<PartitionConsumer>> {
        let Some(mut guard) = self.lock_existing(topic).await else {
            return Vec::new();
        };
        let consumers = guard.take_all();
        self.retire(&mut guard);
        consumers
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    fn retire(&self, guard: &mut SlotGuard) {
        guard.retired = true;
        let slot = guard.slot.clone();
        self.topics
            .remove_if(&guard.topic, |_, registered| Arc::ptr_eq(registered, &slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::ClientConfig;
    use crate::memory::MemoryCluster;
    use crate::types::OFFSET_OLDEST;

    #[tokio::test]
    async fn released_empty_slot_should_leave_the_registry() {
        let registry = TopicRegistry::default();

        let guard = registry.lock("orders").await;
        assert_eq!(registry.topics(), vec!["orders".to_owned()]);
        registry.release(guard);

        assert!(registry.topics().is_empty());
        assert!(registry.lock_existing("orders").await.is_none());
    }

    #[tokio::test]
    async fn lock_should_not_return_a_retired_slot() {
        let registry = Arc::new(TopicRegistry::default());
        let first = registry.lock("orders").await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let guard = registry.lock("orders").await;
                guard.retired
            })
        };
        tokio::task::yield_now().await;
        registry.release(first);

        assert!(!waiter.await.unwrap());
        assert_eq!(registry.topics(), vec!["orders".to_owned()]);
    }

    #[tokio::test]
    async fn closed_consumers_should_be_unregistered_on_lock() {
        let cluster = MemoryCluster::new(&["127.0.0.1:9092"]);
        cluster.create_topic("orders", 2);
        let broker = cluster.broker();
        let config = Arc::new(ClientConfig::default());
        let registry = TopicRegistry::default();
        let mut consumers = Vec::new();
        for partition in 0..2 {
            let consumer = PartitionConsumer::open(
                broker.as_ref(),
                config.clone(),
                "orders",
                partition,
                OFFSET_OLDEST,
            )
            .await
            .unwrap();
            consumers.push(Arc::new(consumer));
        }
        {
            let mut slot = registry.lock("orders").await;
            for consumer in &consumers {
                slot.singles.insert(consumer.partition(), consumer.clone());
            }
        }

        consumers[0].close().await;
        assert_eq!(registry.lock("orders").await.partitions(), vec![1]);

        consumers[1].close().await;
        registry.prune("orders").await;
        assert!(registry.lock_existing("orders").await.is_none());
        assert!(registry.topics().is_empty());
    }

    #[tokio::test]
    async fn remove_topic_should_be_noop_for_unknown_topic() {
        let registry = TopicRegistry::default();

        assert!(registry.remove_topic("orders").await.is_empty());
        assert!(registry.remove_topic("orders").await.is_empty());
    }
}
