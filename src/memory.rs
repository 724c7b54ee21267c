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

//! In-process broker holding topics in memory.
//!
//! It implements [`Connector`] and [`Broker`] with the same observable
//! semantics as a remote cluster: offset bounds, timestamp lookups, retention
//! at the head of a partition, live tailing, and faults when a topic is
//! deleted under an open stream.

use crate::broker::{Broker, Connector, RecordStream};
use crate::configs::ClientConfig;
use crate::error::BrokerError;
use crate::types::{MessageRecord, Offset, OffsetBounds, PartitionId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

#[derive(Debug)]
struct ClusterState {
    addresses: Vec<String>,
    reachable: AtomicBool,
    topics: DashMap<String, Arc<MemoryTopic>>,
    open_streams: AtomicUsize,
}

#[derive(Debug)]
struct MemoryTopic {
    partitions: Vec<Arc<MemoryPartition>>,
}

#[derive(Debug)]
struct MemoryPartition {
    log: RwLock<PartitionLog>,
    changes: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    start_offset: Offset,
    records: VecDeque<StoredRecord>,
    pending_errors: VecDeque<BrokerError>,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
    timestamp: i64,
}

enum ReadStep {
    Record(Offset, StoredRecord),
    Failed(BrokerError),
    Wait,
}

impl PartitionLog {
    fn bounds(&self) -> OffsetBounds {
        OffsetBounds {
            oldest: self.start_offset,
            newest: self.start_offset + self.records.len() as Offset,
        }
    }

    fn read_at(&mut self, offset: Offset) -> ReadStep {
        if self.deleted {
            return ReadStep::Failed(BrokerError::Fault("partition was deleted".to_owned()));
        }
        if let Some(error) = self.pending_errors.pop_front() {
            return ReadStep::Failed(error);
        }
        if offset < self.start_offset {
            return ReadStep::Failed(BrokerError::Fault(format!(
                "offset: {offset} was removed by retention, oldest available offset is: {}",
                self.start_offset
            )));
        }
        let index = (offset - self.start_offset) as usize;
        match self.records.get(index) {
            Some(record) => ReadStep::Record(offset, record.clone()),
            None => ReadStep::Wait,
        }
    }
}

impl MemoryPartition {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            log: RwLock::new(PartitionLog::default()),
            changes,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

impl ClusterState {
    fn ensure_reachable(&self) -> Result<(), BrokerError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::Unreachable(format!(
                "no response from: {}",
                self.addresses.join(",")
            )))
        }
    }

    fn partition(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Arc<MemoryPartition>, BrokerError> {
        let topic = self
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or(BrokerError::UnknownTopic)?;
        topic
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or(BrokerError::UnknownPartition)
    }
}

impl MemoryCluster {
    pub fn new(addresses: &[&str]) -> Self {
        Self {
            state: Arc::new(ClusterState {
                addresses: addresses.iter().map(|address| address.to_string()).collect(),
                reachable: AtomicBool::new(true),
                topics: DashMap::new(),
                open_streams: AtomicUsize::new(0),
            }),
        }
    }

    /// A broker session that skips address validation.
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::new(MemoryBroker {
            state: self.state.clone(),
        })
    }

    pub fn addresses(&self) -> &[String] {
        &self.state.addresses
    }

    /// Returns `false` if the topic already exists.
    pub fn create_topic(&self, name: &str, partitions: u32) -> bool {
        if self.state.topics.contains_key(name) {
            return false;
        }
        let topic = MemoryTopic {
            partitions: (0..partitions)
                .map(|_| Arc::new(MemoryPartition::new()))
                .collect(),
        };
        self.state.topics.insert(name.to_owned(), Arc::new(topic));
        info!("Created topic: {name} with {partitions} partition(s)");
        true
    }

    /// Removes the topic. Streams still reading it fail with a fault.
    pub async fn delete_topic(&self, name: &str) -> bool {
        let Some((_, topic)) = self.state.topics.remove(name) else {
            return false;
        };
        for partition in &topic.partitions {
            partition.log.write().await.deleted = true;
            partition.notify();
        }
        info!("Deleted topic: {name}");
        true
    }

    pub async fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Result<Offset, BrokerError> {
        let memory_partition = self.state.partition(topic, partition)?;
        let offset = {
            let mut log = memory_partition.log.write().await;
            let offset = log.bounds().newest;
            log.records.push_back(StoredRecord {
                key,
                value: value.into(),
                timestamp,
            });
            offset
        };
        memory_partition.notify();
        Ok(offset)
    }

    /// Appends a keyless record stamped with the current time.
    pub async fn append_value(
        &self,
        topic: &str,
        partition: PartitionId,
        value: impl Into<Bytes>,
    ) -> Result<Offset, BrokerError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.append(topic, partition, None, value, timestamp).await
    }

    /// Drops every record below `before`, as retention would.
    pub async fn truncate(
        &self,
        topic: &str,
        partition: PartitionId,
        before: Offset,
    ) -> Result<(), BrokerError> {
        let memory_partition = self.state.partition(topic, partition)?;
        {
            let mut log = memory_partition.log.write().await;
            let before = before.min(log.bounds().newest);
            while log.start_offset < before {
                log.records.pop_front();
                log.start_offset += 1;
            }
        }
        memory_partition.notify();
        debug!("Truncated topic: {topic}, partition: {partition} before offset: {before}");
        Ok(())
    }

    /// The next read from the partition fails with `error`. A recoverable error
    /// leaves the stream usable, any other error ends it.
    pub async fn inject_error(
        &self,
        topic: &str,
        partition: PartitionId,
        error: BrokerError,
    ) -> Result<(), BrokerError> {
        let memory_partition = self.state.partition(topic, partition)?;
        memory_partition
            .log
            .write()
            .await
            .pending_errors
            .push_back(error);
        memory_partition.notify();
        Ok(())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::Release);
    }

    /// Number of streams opened and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.state.open_streams.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(
        &self,
        addresses: &[String],
        config: &ClientConfig,
    ) -> Result<Arc<dyn Broker>, BrokerError> {
        self.state.ensure_reachable()?;
        if !addresses
            .iter()
            .any(|address| self.state.addresses.contains(address))
        {
            return Err(BrokerError::Unreachable(format!(
                "none of the addresses: {} belongs to the cluster",
                addresses.join(",")
            )));
        }
        debug!("Client: {} connected to the in-memory cluster", config.client_id);
        Ok(self.broker())
    }
}

#[derive(Debug)]
struct MemoryBroker {
    state: Arc<ClusterState>,
}

struct StreamGuard(Arc<ClusterState>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.open_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

struct StreamState {
    partition: Arc<MemoryPartition>,
    changes: watch::Receiver<u64>,
    next_offset: Offset,
    finished: bool,
    _guard: StreamGuard,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        self.state.ensure_reachable()?;
        let topic = self
            .state
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .ok_or(BrokerError::UnknownTopic)?;
        Ok((0..topic.partitions.len() as PartitionId).collect())
    }

    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp: i64,
    ) -> Result<Option<Offset>, BrokerError> {
        self.state.ensure_reachable()?;
        let partition = self.state.partition(topic, partition)?;
        let log = partition.log.read().await;
        Ok(log
            .records
            .iter()
            .position(|record| record.timestamp >= timestamp)
            .map(|index| log.start_offset + index as Offset))
    }

    async fn offset_bounds(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<OffsetBounds, BrokerError> {
        self.state.ensure_reachable()?;
        let partition = self.state.partition(topic, partition)?;
        let bounds = partition.log.read().await.bounds();
        Ok(bounds)
    }

    async fn open_stream(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<RecordStream, BrokerError> {
        self.state.ensure_reachable()?;
        let memory_partition = self.state.partition(topic, partition)?;
        let bounds = memory_partition.log.read().await.bounds();
        if !bounds.contains(offset) {
            return Err(BrokerError::OffsetOutOfRange {
                offset,
                oldest: bounds.oldest,
                newest: bounds.newest,
            });
        }

        self.state.open_streams.fetch_add(1, Ordering::AcqRel);
        let state = StreamState {
            changes: memory_partition.changes.subscribe(),
            partition: memory_partition,
            next_offset: offset,
            finished: false,
            _guard: StreamGuard(self.state.clone()),
        };
        let topic = topic.to_owned();

        let stream = futures::stream::unfold(state, move |mut state| {
            let topic = topic.clone();
            async move {
                if state.finished {
                    return None;
                }
                loop {
                    state.changes.mark_unchanged();
                    let partition_log = state.partition.clone();
                    let step = partition_log.log.write().await.read_at(state.next_offset);
                    match step {
                        ReadStep::Record(offset, stored) => {
                            state.next_offset = offset + 1;
                            let record = MessageRecord {
                                topic: topic.clone(),
                                partition,
                                offset,
                                key: stored.key,
                                value: stored.value,
                                timestamp: stored.timestamp,
                            };
                            return Some((Ok(record), state));
                        }
                        ReadStep::Failed(error) => {
                            state.finished = !error.is_recoverable();
                            return Some((Err(error), state));
                        }
                        ReadStep::Wait => {
                            if state.changes.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "orders";

    async fn cluster_with_records(count: i64) -> MemoryCluster {
        let cluster = MemoryCluster::new(&["127.0.0.1:9092"]);
        cluster.create_topic(TOPIC, 2);
        for i in 0..count {
            cluster
                .append(TOPIC, 0, None, format!("message-{i}"), 1_000 + i * 10)
                .await
                .unwrap();
        }
        cluster
    }

    #[tokio::test]
    async fn should_report_bounds_and_timestamps() {
        let cluster = cluster_with_records(5).await;
        let broker = cluster.broker();

        let bounds = broker.offset_bounds(TOPIC, 0).await.unwrap();
        assert_eq!(bounds, OffsetBounds { oldest: 0, newest: 5 });
        assert_eq!(broker.offset_for_timestamp(TOPIC, 0, 1_015).await, Ok(Some(2)));
        assert_eq!(broker.offset_for_timestamp(TOPIC, 0, 0).await, Ok(Some(0)));
        assert_eq!(broker.offset_for_timestamp(TOPIC, 0, 5_000).await, Ok(None));
        assert_eq!(broker.offset_for_timestamp(TOPIC, 1, 0).await, Ok(None));
        assert_eq!(
            broker.offset_bounds(TOPIC, 7).await,
            Err(BrokerError::UnknownPartition)
        );
        assert_eq!(
            broker.partitions("missing").await,
            Err(BrokerError::UnknownTopic)
        );
    }

    #[tokio::test]
    async fn stream_should_tail_new_records() {
        let cluster = cluster_with_records(2).await;
        let broker = cluster.broker();
        let mut stream = broker.open_stream(TOPIC, 0, 1).await.unwrap();
        assert_eq!(cluster.open_streams(), 1);

        assert_eq!(stream.next().await.unwrap().unwrap().offset, 1);

        let appender = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            appender.append_value(TOPIC, 0, "late").await.unwrap();
        });
        let record = stream.next().await.unwrap().unwrap();
        assert_eq!(record.offset, 2);
        assert_eq!(record.value, Bytes::from_static(b"late"));

        drop(stream);
        assert_eq!(cluster.open_streams(), 0);
    }

    #[tokio::test]
    async fn should_reject_streams_outside_of_bounds() {
        let cluster = cluster_with_records(4).await;
        cluster.truncate(TOPIC, 0, 2).await.unwrap();
        let broker = cluster.broker();

        let result = broker.open_stream(TOPIC, 0, 1).await;
        assert!(matches!(
            result,
            Err(BrokerError::OffsetOutOfRange {
                offset: 1,
                oldest: 2,
                newest: 4
            })
        ));
        assert!(broker.open_stream(TOPIC, 0, 5).await.is_err());
        assert!(broker.open_stream(TOPIC, 0, 4).await.is_ok());
    }

    #[tokio::test]
    async fn stream_should_fault_when_topic_is_deleted() {
        let cluster = cluster_with_records(0).await;
        let mut stream = cluster.broker().open_stream(TOPIC, 0, 0).await.unwrap();

        cluster.delete_topic(TOPIC).await;

        assert!(matches!(stream.next().await, Some(Err(BrokerError::Fault(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_error_should_not_end_the_stream() {
        let cluster = cluster_with_records(1).await;
        cluster
            .inject_error(TOPIC, 0, BrokerError::Message("corrupt record".to_owned()))
            .await
            .unwrap();
        let mut stream = cluster.broker().open_stream(TOPIC, 0, 0).await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(BrokerError::Message(_)))
        ));
        assert_eq!(stream.next().await.unwrap().unwrap().offset, 0);
    }

    #[tokio::test]
    async fn connect_should_fail_for_unknown_addresses_or_unreachable_cluster() {
        let cluster = cluster_with_records(0).await;
        let config = ClientConfig::default();

        let unknown = cluster.connect(&["10.0.0.1:9092".to_owned()], &config).await;
        assert!(matches!(unknown, Err(BrokerError::Unreachable(_))));

        cluster.set_reachable(false);
        let unreachable = cluster
            .connect(&["127.0.0.1:9092".to_owned()], &config)
            .await;
        assert!(matches!(unreachable, Err(BrokerError::Unreachable(_))));
    }
}
