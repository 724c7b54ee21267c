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

use crate::broker::{Broker, Connector};
use crate::configs::ClientConfig;
use crate::error::{BrokerError, ConsumerError};
use crate::manager::group::{TopicConsumerGroup, TopicReport};
use crate::manager::registry::TopicRegistry;
use crate::offsets::OffsetResolver;
use crate::partition::{PartitionConsumer, PartitionSummary};
use crate::sink::{ChannelSink, ConsumerEvent, MessageSink};
use crate::types::{Offset, PartitionId, StartPosition};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Entry point for consuming topics.
///
/// The client keeps every consumer it opens in a registry keyed by topic and
/// partition. Topic-wide subscriptions and single-partition consumers share
/// that registry, so [`stop_topic`](Self::stop_topic) stops both kinds.
pub struct ConsumerClient {
    addresses: Vec<String>,
    config: Arc<ClientConfig>,
    broker: Arc<dyn Broker>,
    resolver: OffsetResolver,
    sink: Arc<dyn MessageSink>,
    registry: TopicRegistry,
}

impl ConsumerClient {
    /// Connects to the brokers, failing fast when none of them can be reached.
    pub async fn connect(
        connector: &dyn Connector,
        addresses: &[String],
        config: ClientConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        validate_addresses(addresses)?;

        let joined_addresses = addresses.join(",");
        info!(
            "Connecting client: {} to brokers: {joined_addresses}...",
            config.client_id
        );
        let broker = tokio::time::timeout(
            *config.connect_timeout,
            connector.connect(addresses, &config),
        )
        .await
        .map_err(|_| {
            error!(
                "Brokers: {joined_addresses} did not respond within {}",
                config.connect_timeout
            );
            ConsumerError::Connectivity(format!(
                "no response from brokers: {joined_addresses} within {}",
                config.connect_timeout
            ))
        })?
        .map_err(|error| {
            error!("Failed to connect to brokers: {joined_addresses}: {error}");
            match error {
                BrokerError::Unreachable(reason) => ConsumerError::Connectivity(reason),
                error => ConsumerError::Connectivity(error.to_string()),
            }
        })?;
        info!(
            "Client: {} connected to brokers: {joined_addresses}",
            config.client_id
        );

        let mut client = Self::new(broker, config, sink);
        client.addresses = addresses.to_vec();
        Ok(client)
    }

    /// Connects to the brokers listed in the configuration.
    pub async fn from_config(
        connector: &dyn Connector,
        config: ClientConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, ConsumerError> {
        let addresses = config.brokers.clone();
        Self::connect(connector, &addresses, config, sink).await
    }

    /// Wraps an already established broker session.
    pub fn new(broker: Arc<dyn Broker>, config: ClientConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            addresses: Vec::new(),
            config: Arc::new(config),
            resolver: OffsetResolver::new(broker.clone()),
            broker,
            sink,
            registry: TopicRegistry::default(),
        }
    }

    /// A channel sink sized by `channel_buffer_size`.
    pub fn channel_sink(config: &ClientConfig) -> (ChannelSink, flume::Receiver<ConsumerEvent>) {
        ChannelSink::bounded(config.channel_buffer_size)
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribes every topic from `start`: a timestamp in milliseconds or an
    /// offset depending on the start policy, or one of the offset sentinels.
    /// Either all topics are subscribed or none is.
    pub async fn subscribe_topics<I, S>(&self, topics: I, start: i64) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let position = StartPosition::from_raw(start, self.config.start_policy)?;
        let topics: BTreeSet<String> = topics
            .into_iter()
            .map(|topic| topic.as_ref().to_owned())
            .collect();

        let mut subscribed: Vec<&str> = Vec::with_capacity(topics.len());
        for topic in &topics {
            if let Err(error) = self.subscribe_topic(topic, position).await {
                if !subscribed.is_empty() {
                    warn!(
                        "Rolling back subscriptions of topics: {} after topic: {topic} failed.",
                        subscribed.join(",")
                    );
                }
                for topic in &subscribed {
                    self.stop_topic(topic).await;
                }
                return Err(error);
            }
            subscribed.push(topic.as_str());
        }
        Ok(())
    }

    /// Subscribes every partition of a single topic.
    pub async fn subscribe_topic(
        &self,
        topic: &str,
        position: StartPosition,
    ) -> Result<(), ConsumerError> {
        let mut slot = self.registry.lock(topic).await;
        if let Some(&partition) = slot.partitions().first() {
            return Err(ConsumerError::AlreadySubscribed {
                topic: topic.to_owned(),
                partition,
            });
        }

        match TopicConsumerGroup::start(
            self.broker.as_ref(),
            &self.resolver,
            self.config.clone(),
            topic,
            position,
        )
        .await
        {
            Ok(group) => {
                slot.group = Some(group);
                info!("Subscribed topic: {topic} from {position}.");
                Ok(())
            }
            Err(error) => {
                error!("Failed to subscribe topic: {topic}: {error}");
                self.registry.release(slot);
                Err(error)
            }
        }
    }

    /// Consumes every subscribed partition of the topic until the topic is stopped.
    /// Partitions that finish or fail are unregistered and can be subscribed again.
    pub async fn consume_topic(&self, topic: &str) -> Result<TopicReport, ConsumerError> {
        let group = self
            .registry
            .lock_existing(topic)
            .await
            .and_then(|slot| slot.group.clone())
            .ok_or_else(|| ConsumerError::TopicNotSubscribed(topic.to_owned()))?;

        let report = group.consume_all(self.sink.clone()).await;
        self.registry.prune(topic).await;
        Ok(report)
    }

    /// Stops every consumer of the topic, topic-wide and single-partition alike.
    /// Stopping a topic that is not subscribed does nothing.
    pub async fn stop_topic(&self, topic: &str) {
        let consumers = self.registry.remove_topic(topic).await;
        if consumers.is_empty() {
            debug!("Topic: {topic} is not subscribed, nothing to stop.");
            return;
        }
        join_all(consumers.iter().map(|consumer| consumer.close())).await;
        info!(
            "Stopped {} consumer(s) of topic: {topic}.",
            consumers.len()
        );
    }

    /// Opens and registers a consumer for a single partition.
    pub async fn new_partition_consumer(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Arc<PartitionConsumer>, ConsumerError> {
        let mut slot = self.registry.lock(topic).await;
        if slot.contains(partition) {
            return Err(ConsumerError::AlreadySubscribed {
                topic: topic.to_owned(),
                partition,
            });
        }

        match PartitionConsumer::open(
            self.broker.as_ref(),
            self.config.clone(),
            topic,
            partition,
            offset,
        )
        .await
        {
            Ok(consumer) => {
                let consumer = Arc::new(consumer);
                slot.singles.insert(partition, consumer.clone());
                Ok(consumer)
            }
            Err(error) => {
                error!("Failed to open topic: {topic}, partition: {partition}: {error}");
                self.registry.release(slot);
                Err(error)
            }
        }
    }

    /// Consumes a single registered partition until the topic is stopped.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<PartitionSummary, ConsumerError> {
        let consumer = self
            .registry
            .lock_existing(topic)
            .await
            .and_then(|slot| slot.find(partition))
            .ok_or_else(|| ConsumerError::PartitionNotSubscribed {
                topic: topic.to_owned(),
                partition,
            })?;

        let result = consumer.consume(self.sink.as_ref()).await;
        self.registry.prune(topic).await;
        result
    }

    /// Stops every subscribed topic.
    pub async fn shutdown(&self) {
        let topics = self.registry.topics();
        info!("Shutting down consumers of {} topic(s).", topics.len());
        for topic in topics {
            self.stop_topic(&topic).await;
        }
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        !self.active_partitions(topic).await.is_empty()
    }

    /// Partitions of the topic that currently have a registered consumer.
    pub async fn active_partitions(&self, topic: &str) -> Vec<PartitionId> {
        match self.registry.lock_existing(topic).await {
            Some(slot) => slot.partitions(),
            None => Vec::new(),
        }
    }

    pub async fn subscriptions(&self) -> BTreeMap<String, Vec<PartitionId>> {
        let mut subscriptions = BTreeMap::new();
        for topic in self.registry.topics() {
            let partitions = self.active_partitions(&topic).await;
            if !partitions.is_empty() {
                subscriptions.insert(topic, partitions);
            }
        }
        subscriptions
    }
}

fn validate_addresses(addresses: &[String]) -> Result<(), ConsumerError> {
    if addresses.is_empty() {
        return Err(ConsumerError::InvalidConfiguration(
            "at least one broker address is required".to_owned(),
        ));
    }
    for address in addresses {
        let valid = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(ConsumerError::InvalidConfiguration(format!(
                "invalid broker address: {address}, expected host:port"
            )));
        }
    }
    Ok(())
}

impl fmt::Debug for ConsumerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerClient")
            .field("addresses", &self.addresses)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RecordStream;
    use crate::partition::StopReason;
    use crate::types::{MessageRecord, OFFSET_OLDEST, OffsetBounds};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use test_case::test_case;

    const RECORDS: Offset = 3;

    /// Serves a single partition whose stream ends after its last record.
    #[derive(Debug)]
    struct FiniteBroker;

    #[async_trait]
    impl Broker for FiniteBroker {
        async fn partitions(&self, _topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
            Ok(vec![0])
        }

        async fn offset_for_timestamp(
            &self,
            _topic: &str,
            _partition: PartitionId,
            _timestamp: i64,
        ) -> Result<Option<Offset>, BrokerError> {
            Ok(None)
        }

        async fn offset_bounds(
            &self,
            _topic: &str,
            _partition: PartitionId,
        ) -> Result<OffsetBounds, BrokerError> {
            Ok(OffsetBounds {
                oldest: 0,
                newest: RECORDS,
            })
        }

        async fn open_stream(
            &self,
            topic: &str,
            partition: PartitionId,
            offset: Offset,
        ) -> Result<RecordStream, BrokerError> {
            let topic = topic.to_owned();
            let records = (offset..RECORDS).map(move |offset| {
                Ok(MessageRecord {
                    topic: topic.clone(),
                    partition,
                    offset,
                    key: None,
                    value: Bytes::from_static(b"payload"),
                    timestamp: 1_000 + offset,
                })
            });
            Ok(futures::stream::iter(records).boxed())
        }
    }

    fn finite_client() -> (ConsumerClient, flume::Receiver<ConsumerEvent>) {
        let (sink, receiver) = ChannelSink::unbounded();
        let client = ConsumerClient::new(
            Arc::new(FiniteBroker),
            ClientConfig::default(),
            Arc::new(sink),
        );
        (client, receiver)
    }

    #[tokio::test]
    async fn ended_topic_partitions_should_be_unregistered() {
        let (client, receiver) = finite_client();
        client.subscribe_topics(["orders"], OFFSET_OLDEST).await.unwrap();

        let report = client.consume_topic("orders").await.unwrap();

        let summary = report.outcomes[&0].as_ref().unwrap();
        assert_eq!(summary.reason, StopReason::StreamEnded);
        assert_eq!(summary.next_offset, RECORDS);
        assert_eq!(receiver.drain().count(), RECORDS as usize);
        assert!(!client.is_subscribed("orders").await);
        assert!(client.subscriptions().await.is_empty());
        client.subscribe_topics(["orders"], OFFSET_OLDEST).await.unwrap();
        assert_eq!(client.active_partitions("orders").await, vec![0]);
    }

    #[tokio::test]
    async fn ended_partition_consumer_should_be_unregistered() {
        let (client, _receiver) = finite_client();
        client.new_partition_consumer("orders", 0, 1).await.unwrap();

        let summary = client.consume_partition("orders", 0).await.unwrap();

        assert_eq!(summary.reason, StopReason::StreamEnded);
        assert_eq!(summary.delivered, 2);
        assert!(!client.is_subscribed("orders").await);
        assert!(client.new_partition_consumer("orders", 0, 0).await.is_ok());
    }

    #[test_case(&[]; "empty")]
    #[test_case(&["localhost"]; "missing port")]
    #[test_case(&[":9092"]; "missing host")]
    #[test_case(&["localhost:port"]; "invalid port")]
    fn should_reject_invalid_addresses(addresses: &[&str]) {
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        assert!(matches!(
            validate_addresses(&addresses),
            Err(ConsumerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn should_accept_host_port_addresses() {
        let addresses = vec!["10.216.10.155:9092".to_owned(), "[::1]:9092".to_owned()];
        assert!(validate_addresses(&addresses).is_ok());
    }
}
