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

use crate::error::{ConsumerError, SinkError};
use crate::types::MessageRecord;
use async_trait::async_trait;
use tracing::debug;

/// Receives the records read by the partition consumers.
///
/// `deliver` is called from one task per partition, so records of a single
/// partition arrive in offset order while different partitions interleave.
/// A slow `deliver` applies backpressure to its partition only.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, record: MessageRecord) -> Result<(), SinkError>;

    /// Called for message-level errors (when the error mode is `return`)
    /// and for partition faults.
    async fn on_error(&self, _error: &ConsumerError) {}
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Message(MessageRecord),
    Error(ConsumerError),
}

/// Sink forwarding every record and error into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: flume::Sender<ConsumerEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<ConsumerEvent>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Self { sender }, receiver)
    }

    pub fn unbounded() -> (Self, flume::Receiver<ConsumerEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, record: MessageRecord) -> Result<(), SinkError> {
        self.sender
            .send_async(ConsumerEvent::Message(record))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn on_error(&self, error: &ConsumerError) {
        if self
            .sender
            .send_async(ConsumerEvent::Error(error.clone()))
            .await
            .is_err()
        {
            debug!("Channel sink is closed, dropping error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(offset: i64) -> MessageRecord {
        MessageRecord {
            topic: "orders".to_owned(),
            partition: 0,
            offset,
            key: None,
            value: Bytes::from_static(b"payload"),
            timestamp: 1_000,
        }
    }

    #[tokio::test]
    async fn should_forward_records_and_errors() {
        let (sink, receiver) = ChannelSink::unbounded();
        sink.deliver(record(7)).await.unwrap();
        sink.on_error(&ConsumerError::TopicNotFound("orders".to_owned()))
            .await;

        match receiver.recv_async().await.unwrap() {
            ConsumerEvent::Message(record) => assert_eq!(record.offset, 7),
            event => panic!("unexpected event: {event:?}"),
        }
        assert!(matches!(
            receiver.recv_async().await.unwrap(),
            ConsumerEvent::Error(ConsumerError::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn should_fail_delivery_when_receiver_is_dropped() {
        let (sink, receiver) = ChannelSink::bounded(1);
        drop(receiver);

        assert_eq!(sink.deliver(record(0)).await, Err(SinkError::Closed));
    }
}
