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

use crate::broker::{Broker, RecordStream};
use crate::configs::{ClientConfig, ErrorMode};
use crate::error::{ConsumerError, SinkError};
use crate::sink::MessageSink;
use crate::types::{MessageRecord, OFFSET_NEWEST, OFFSET_OLDEST, Offset, PartitionId};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The consumer was closed.
    Closed,
    /// The broker ended the stream without an error.
    StreamEnded,
}

/// What a finished consumption run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub topic: String,
    pub partition: PartitionId,
    pub delivered: u64,
    /// The offset consumption would continue from.
    pub next_offset: Offset,
    pub reason: StopReason,
}

enum Delivery {
    Delivered,
    Rejected(SinkError),
    Dropped,
}

/// Owns the stream over a single partition.
///
/// The stream is handed to the first [`consume`](Self::consume) call, so a
/// consumer runs at most one loop. [`close`](Self::close) may be called from
/// any task at any time and only the first call has an effect.
pub struct PartitionConsumer {
    topic: String,
    partition: PartitionId,
    start_offset: Offset,
    config: Arc<ClientConfig>,
    stream: Mutex<Option<RecordStream>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl PartitionConsumer {
    /// Opens a stream at `offset`, which may be one of the sentinels.
    pub async fn open(
        broker: &dyn Broker,
        config: Arc<ClientConfig>,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<Self, ConsumerError> {
        let bounds = broker
            .offset_bounds(topic, partition)
            .await
            .map_err(|error| error.into_consumer_error(topic, partition))?;
        let start_offset = match offset {
            OFFSET_OLDEST => bounds.oldest,
            OFFSET_NEWEST => bounds.newest,
            offset if offset < 0 => return Err(ConsumerError::InvalidOffset(offset)),
            offset if !bounds.contains(offset) => {
                return Err(ConsumerError::OffsetOutOfRange {
                    topic: topic.to_owned(),
                    partition,
                    offset,
                    oldest: bounds.oldest,
                    newest: bounds.newest,
                });
            }
            offset => offset,
        };

        let stream = broker
            .open_stream(topic, partition, start_offset)
            .await
            .map_err(|error| error.into_consumer_error(topic, partition))?;
        let (shutdown, _) = watch::channel(false);
        info!(
            "Opened consumer for topic: {topic}, partition: {partition} at offset: {start_offset}"
        );
        Ok(Self {
            topic: topic.to_owned(),
            partition,
            start_offset,
            config,
            stream: Mutex::new(Some(stream)),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn start_offset(&self) -> Offset {
        self.start_offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delivers records to `sink` until the consumer is closed or the stream fails.
    /// The consumer is closed when this returns.
    pub async fn consume(&self, sink: &dyn MessageSink) -> Result<PartitionSummary, ConsumerError> {
        let mut shutdown = self.shutdown.subscribe();
        let taken = self.stream.lock().await.take();
        let Some(mut stream) = taken else {
            if self.is_closed() {
                return Ok(self.summary(0, self.start_offset, StopReason::Closed));
            }
            return Err(ConsumerError::AlreadyConsuming {
                topic: self.topic.clone(),
                partition: self.partition,
            });
        };

        // A caller that drops this future mid-run still leaves the consumer closed.
        let _close_on_drop = CloseOnDrop(self);
        debug!(
            "Consuming topic: {}, partition: {} from offset: {}",
            self.topic, self.partition, self.start_offset
        );
        let result = self.run(&mut stream, &mut shutdown, sink).await;
        drop(stream);
        match &result {
            Ok(summary) => info!(
                "Stopped consuming topic: {}, partition: {} ({:?}) after delivering {} record(s)",
                self.topic, self.partition, summary.reason, summary.delivered
            ),
            Err(error) => error!(
                "Consuming topic: {}, partition: {} failed: {error}",
                self.topic, self.partition
            ),
        }
        self.close().await;
        result
    }

    async fn run(
        &self,
        stream: &mut RecordStream,
        shutdown: &mut watch::Receiver<bool>,
        sink: &dyn MessageSink,
    ) -> Result<PartitionSummary, ConsumerError> {
        let mut next_offset = self.start_offset;
        let mut delivered = 0;
        loop {
            let item = tokio::select! {
                biased;
                _ = closed(shutdown) => {
                    return Ok(self.summary(delivered, next_offset, StopReason::Closed));
                }
                item = stream.next() => item,
            };

            let record = match item {
                None => return Ok(self.summary(delivered, next_offset, StopReason::StreamEnded)),
                Some(Ok(record)) => record,
                Some(Err(error)) if error.is_recoverable() => {
                    let error = error.into_consumer_error(&self.topic, self.partition);
                    self.handle_message_error(error, sink).await?;
                    continue;
                }
                Some(Err(error)) => {
                    return Err(error.into_consumer_error(&self.topic, self.partition));
                }
            };

            let offset = record.offset;
            if offset < next_offset {
                trace!(
                    "Skipping already delivered offset: {offset} for topic: {}, partition: {}",
                    self.topic, self.partition
                );
                continue;
            }
            if offset > next_offset {
                debug!(
                    "Offsets {next_offset}..{offset} of topic: {}, partition: {} are not available",
                    self.topic, self.partition
                );
            }

            match self.deliver(record, sink, shutdown).await {
                Delivery::Delivered => {
                    delivered += 1;
                    next_offset = offset + 1;
                }
                Delivery::Rejected(SinkError::Closed) => {
                    return Err(ConsumerError::Delivery {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset: Some(offset),
                        reason: SinkError::Closed.to_string(),
                    });
                }
                Delivery::Rejected(sink_error) => {
                    next_offset = offset + 1;
                    let error = ConsumerError::Delivery {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset: Some(offset),
                        reason: sink_error.to_string(),
                    };
                    self.handle_message_error(error, sink).await?;
                }
                Delivery::Dropped => {
                    return Ok(self.summary(delivered, next_offset, StopReason::Closed));
                }
            }
        }
    }

    /// Hands the record to the sink. If the consumer gets closed meanwhile, the
    /// delivery gets `close_timeout` to finish before the record is dropped.
    async fn deliver(
        &self,
        record: MessageRecord,
        sink: &dyn MessageSink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Delivery {
        let offset = record.offset;
        let mut delivery = sink.deliver(record);
        tokio::select! {
            biased;
            result = &mut delivery => return Delivery::from(result),
            _ = closed(shutdown) => {}
        }

        match tokio::time::timeout(*self.config.close_timeout, delivery).await {
            Ok(result) => Delivery::from(result),
            Err(_) => {
                warn!(
                    "Dropping in-flight record at offset: {offset} of topic: {}, partition: {}, the sink did not accept it within {}",
                    self.topic, self.partition, self.config.close_timeout
                );
                Delivery::Dropped
            }
        }
    }

    async fn handle_message_error(
        &self,
        error: ConsumerError,
        sink: &dyn MessageSink,
    ) -> Result<(), ConsumerError> {
        match self.config.error_mode {
            ErrorMode::Log => {
                warn!("{error}");
                Ok(())
            }
            ErrorMode::Return => {
                sink.on_error(&error).await;
                Ok(())
            }
            ErrorMode::Fatal => Err(error),
        }
    }

    /// Signals a running [`consume`](Self::consume) to return and releases the stream.
    pub async fn close(&self) {
        if !self.signal_close() {
            return;
        }
        let stream = self.stream.lock().await.take();
        drop(stream);
    }

    /// Marks the consumer closed and wakes a running loop. Returns `false` if
    /// it was already closed.
    fn signal_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.send_replace(true);
        info!(
            "Closed consumer for topic: {}, partition: {}",
            self.topic, self.partition
        );
        true
    }

    fn summary(&self, delivered: u64, next_offset: Offset, reason: StopReason) -> PartitionSummary {
        PartitionSummary {
            topic: self.topic.clone(),
            partition: self.partition,
            delivered,
            next_offset,
            reason,
        }
    }
}

impl From<Result<(), SinkError>> for Delivery {
    fn from(result: Result<(), SinkError>) -> Self {
        match result {
            Ok(()) => Delivery::Delivered,
            Err(error) => Delivery::Rejected(error),
        }
    }
}

struct CloseOnDrop<'a>(&'a PartitionConsumer);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.0.signal_close() {
            warn!(
                "Consuming topic: {}, partition: {} was cancelled",
                self.0.topic, self.0.partition
            );
        }
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

impl fmt::Debug for PartitionConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionConsumer")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("start_offset", &self.start_offset)
            .field("closed", &self.is_closed())
            .finish()
    }
}
