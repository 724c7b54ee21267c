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

use crate::broker::Broker;
use crate::configs::ClientConfig;
use crate::error::ConsumerError;
use crate::offsets::OffsetResolver;
use crate::partition::{PartitionConsumer, PartitionSummary};
use crate::sink::MessageSink;
use crate::types::{PartitionId, StartPosition};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// The partition consumers of one topic.
#[derive(Debug, Clone)]
pub struct TopicConsumerGroup {
    topic: String,
    consumers: BTreeMap<PartitionId, Arc<PartitionConsumer>>,
}

/// Terminal outcome of every partition of a [`TopicConsumerGroup::consume_all`] run.
#[derive(Debug)]
pub struct TopicReport {
    pub topic: String,
    pub outcomes: BTreeMap<PartitionId, Result<PartitionSummary, ConsumerError>>,
}

impl TopicReport {
    pub fn faults(&self) -> impl Iterator<Item = (PartitionId, &ConsumerError)> {
        self.outcomes
            .iter()
            .filter_map(|(partition, outcome)| outcome.as_ref().err().map(|e| (*partition, e)))
    }

    pub fn delivered(&self) -> u64 {
        self.outcomes
            .values()
            .filter_map(|outcome| outcome.as_ref().ok())
            .map(|summary| summary.delivered)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }
}

impl TopicConsumerGroup {
    /// Resolves the start offsets and opens every partition of the topic.
    /// If any partition fails to open, the ones already opened are closed.
    pub async fn start(
        broker: &dyn Broker,
        resolver: &OffsetResolver,
        config: Arc<ClientConfig>,
        topic: &str,
        position: StartPosition,
    ) -> Result<Self, ConsumerError> {
        let offsets = resolver.resolve(topic, position).await?;
        let opened = join_all(offsets.iter().map(|(&partition, &offset)| {
            let config = config.clone();
            async move {
                let result =
                    PartitionConsumer::open(broker, config, topic, partition, offset).await;
                (partition, result)
            }
        }))
        .await;

        let mut consumers = BTreeMap::new();
        let mut failure = None;
        for (partition, result) in opened {
            match result {
                Ok(consumer) => {
                    consumers.insert(partition, Arc::new(consumer));
                }
                Err(error) => {
                    warn!("Failed to open topic: {topic}, partition: {partition}: {error}");
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }

        if let Some(error) = failure {
            join_all(consumers.values().map(|consumer| consumer.close())).await;
            error!(
                "Failed to start consumers for topic: {topic}, closed {} opened partition(s).",
                consumers.len()
            );
            return Err(error);
        }

        info!(
            "Started {} consumer(s) for topic: {topic} from {position}.",
            consumers.len()
        );
        Ok(Self {
            topic: topic.to_owned(),
            consumers,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        self.consumers.keys().copied().collect()
    }

    pub fn get(&self, partition: PartitionId) -> Option<&Arc<PartitionConsumer>> {
        self.consumers.get(&partition)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub(crate) fn remove_closed(&mut self) {
        self.consumers.retain(|_, consumer| !consumer.is_closed());
    }

    /// Runs one task per partition and waits for all of them to finish.
    /// A failing partition does not affect the others; its error is recorded
    /// in the report and passed to the sink's error hook.
    pub async fn consume_all(&self, sink: Arc<dyn MessageSink>) -> TopicReport {
        let mut tasks = JoinSet::new();
        let mut running = HashMap::with_capacity(self.consumers.len());
        for (&partition, consumer) in &self.consumers {
            let task_consumer = consumer.clone();
            let sink = sink.clone();
            let handle = tasks.spawn(async move { task_consumer.consume(sink.as_ref()).await });
            running.insert(handle.id(), (partition, consumer.clone()));
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(join_error) => {
                    let id = join_error.id();
                    let Some((partition, consumer)) = running.get(&id) else {
                        continue;
                    };
                    consumer.close().await;
                    let error = ConsumerError::StreamFault {
                        topic: self.topic.clone(),
                        partition: *partition,
                        reason: format!("consumer task failed: {join_error}"),
                    };
                    (id, Err(error))
                }
            };
            let Some((partition, _)) = running.remove(&id) else {
                continue;
            };
            if let Err(error) = &outcome {
                error!(
                    "Consumer for topic: {}, partition: {partition} failed: {error}",
                    self.topic
                );
                sink.on_error(error).await;
            }
            outcomes.insert(partition, outcome);
        }

        info!(
            "All {} consumer(s) of topic: {} have finished.",
            outcomes.len(),
            self.topic
        );
        TopicReport {
            topic: self.topic.clone(),
            outcomes,
        }
    }

    /// Closes every partition consumer. Safe to call repeatedly and while
    /// [`consume_all`](Self::consume_all) is running.
    pub async fn stop(&self) {
        join_all(self.consumers.values().map(|consumer| consumer.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::memory::MemoryCluster;
    use crate::sink::{ChannelSink, ConsumerEvent};
    use crate::types::Offset;
    use std::time::Duration;

    const TOPIC: &str = "orders";

    async fn setup(partitions: u32, records: usize) -> (MemoryCluster, OffsetResolver) {
        let cluster = MemoryCluster::new(&["127.0.0.1:9092"]);
        cluster.create_topic(TOPIC, partitions);
        for partition in 0..partitions {
            for i in 0..records {
                cluster
                    .append_value(TOPIC, partition, format!("{partition}-{i}"))
                    .await
                    .unwrap();
            }
        }
        let resolver = OffsetResolver::new(cluster.broker());
        (cluster, resolver)
    }

    async fn start(
        cluster: &MemoryCluster,
        resolver: &OffsetResolver,
        position: StartPosition,
    ) -> Result<TopicConsumerGroup, ConsumerError> {
        let broker = cluster.broker();
        TopicConsumerGroup::start(
            broker.as_ref(),
            resolver,
            Arc::new(ClientConfig::default()),
            TOPIC,
            position,
        )
        .await
    }

    #[tokio::test]
    async fn should_open_every_partition() {
        let (cluster, resolver) = setup(3, 2).await;

        let group = start(&cluster, &resolver, StartPosition::Oldest).await.unwrap();

        assert_eq!(group.partitions(), vec![0, 1, 2]);
        assert_eq!(cluster.open_streams(), 3);
        group.stop().await;
        group.stop().await;
        assert_eq!(cluster.open_streams(), 0);
    }

    #[tokio::test]
    async fn should_close_opened_partitions_when_one_fails() {
        let (cluster, resolver) = setup(3, 5).await;
        cluster.truncate(TOPIC, 1, 4).await.unwrap();

        let result = start(&cluster, &resolver, StartPosition::Offset(2)).await;

        assert!(matches!(
            result,
            Err(ConsumerError::OffsetOutOfRange { partition: 1, .. })
        ));
        assert_eq!(cluster.open_streams(), 0);
    }

    #[tokio::test]
    async fn consume_all_should_deliver_every_partition_until_stopped() {
        let (cluster, resolver) = setup(3, 4).await;
        let group = start(&cluster, &resolver, StartPosition::Oldest).await.unwrap();
        let (sink, receiver) = ChannelSink::unbounded();

        let task = {
            let group = group.clone();
            tokio::spawn(async move { group.consume_all(Arc::new(sink)).await })
        };
        let mut per_partition: BTreeMap<PartitionId, Vec<Offset>> = BTreeMap::new();
        for _ in 0..12 {
            if let ConsumerEvent::Message(record) = receiver.recv_async().await.unwrap() {
                per_partition
                    .entry(record.partition)
                    .or_default()
                    .push(record.offset);
            }
        }
        group.stop().await;
        let report = task.await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.delivered(), 12);
        for offsets in per_partition.values() {
            assert_eq!(offsets, &vec![0, 1, 2, 3]);
        }
        assert_eq!(cluster.open_streams(), 0);
    }

    #[tokio::test]
    async fn faulted_partition_should_not_stop_siblings() {
        let (cluster, resolver) = setup(2, 1).await;
        let group = start(&cluster, &resolver, StartPosition::Oldest).await.unwrap();
        let (sink, receiver) = ChannelSink::unbounded();

        let task = {
            let group = group.clone();
            tokio::spawn(async move { group.consume_all(Arc::new(sink)).await })
        };
        receiver.recv_async().await.unwrap();
        receiver.recv_async().await.unwrap();

        cluster
            .inject_error(TOPIC, 0, BrokerError::Fault("disk failure".to_owned()))
            .await
            .unwrap();
        let fault = receiver.recv_async().await.unwrap();
        assert!(matches!(
            fault,
            ConsumerEvent::Error(ConsumerError::StreamFault { partition: 0, .. })
        ));

        cluster.append_value(TOPIC, 1, "sibling").await.unwrap();
        match receiver.recv_async().await.unwrap() {
            ConsumerEvent::Message(record) => {
                assert_eq!(record.partition, 1);
                assert_eq!(record.offset, 1);
            }
            event => panic!("unexpected event: {event:?}"),
        }
        assert!(group.get(0).unwrap().is_closed());
        assert!(!group.get(1).unwrap().is_closed());

        group.stop().await;
        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            report.outcomes[&0],
            Err(ConsumerError::StreamFault { .. })
        ));
        assert_eq!(report.outcomes[&1].as_ref().unwrap().delivered, 2);
        assert_eq!(report.faults().count(), 1);
        assert_eq!(cluster.open_streams(), 0);
    }
}
