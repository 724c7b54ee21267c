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

use crate::types::{Offset, PartitionId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConsumerError {
    #[error("Cannot reach the brokers: {0}")]
    Connectivity(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Topic: {0} was not found")]
    TopicNotFound(String),
    #[error("Partition: {partition} was not found for topic: {topic}")]
    PartitionNotFound { topic: String, partition: PartitionId },
    #[error(
        "Offset: {offset} is out of range [{oldest}, {newest}] for topic: {topic}, partition: {partition}"
    )]
    OffsetOutOfRange {
        topic: String,
        partition: PartitionId,
        offset: Offset,
        oldest: Offset,
        newest: Offset,
    },
    /// `partition` is `None` when the partition list itself could not be fetched.
    #[error(
        "Cannot resolve the start offset for topic: {topic}{}: {reason}",
        .partition.map(|partition| format!(", partition: {partition}")).unwrap_or_default()
    )]
    OffsetResolution {
        topic: String,
        partition: Option<PartitionId>,
        reason: String,
    },
    #[error("Stream for topic: {topic}, partition: {partition} failed: {reason}")]
    StreamFault {
        topic: String,
        partition: PartitionId,
        reason: String,
    },
    #[error("Delivery failed for topic: {topic}, partition: {partition}, offset: {offset:?}: {reason}")]
    Delivery {
        topic: String,
        partition: PartitionId,
        offset: Option<Offset>,
        reason: String,
    },
    #[error("Invalid start position: {0}")]
    InvalidStartPosition(i64),
    #[error("Invalid offset: {0}")]
    InvalidOffset(Offset),
    #[error("Partition: {partition} of topic: {topic} is already subscribed")]
    AlreadySubscribed { topic: String, partition: PartitionId },
    #[error("Partition: {partition} of topic: {topic} is already being consumed")]
    AlreadyConsuming { topic: String, partition: PartitionId },
    #[error("Topic: {0} is not subscribed")]
    TopicNotSubscribed(String),
    #[error("Partition: {partition} of topic: {topic} is not subscribed")]
    PartitionNotSubscribed { topic: String, partition: PartitionId },
}

/// Errors reported by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Broker is unreachable: {0}")]
    Unreachable(String),
    #[error("Unknown topic")]
    UnknownTopic,
    #[error("Unknown partition")]
    UnknownPartition,
    #[error("Offset: {offset} is out of range [{oldest}, {newest}]")]
    OffsetOutOfRange {
        offset: Offset,
        oldest: Offset,
        newest: Offset,
    },
    /// A single record could not be read; the stream stays usable.
    #[error("Message error: {0}")]
    Message(String),
    /// The stream cannot continue.
    #[error("Stream fault: {0}")]
    Fault(String),
}

impl BrokerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BrokerError::Message(_))
    }

    pub(crate) fn into_consumer_error(self, topic: &str, partition: PartitionId) -> ConsumerError {
        match self {
            BrokerError::Unreachable(reason) => ConsumerError::Connectivity(reason),
            BrokerError::UnknownTopic => ConsumerError::TopicNotFound(topic.to_owned()),
            BrokerError::UnknownPartition => ConsumerError::PartitionNotFound {
                topic: topic.to_owned(),
                partition,
            },
            BrokerError::OffsetOutOfRange {
                offset,
                oldest,
                newest,
            } => ConsumerError::OffsetOutOfRange {
                topic: topic.to_owned(),
                partition,
                offset,
                oldest,
                newest,
            },
            BrokerError::Message(reason) => ConsumerError::Delivery {
                topic: topic.to_owned(),
                partition,
                offset: None,
                reason,
            },
            BrokerError::Fault(reason) => ConsumerError::StreamFault {
                topic: topic.to_owned(),
                partition,
                reason,
            },
        }
    }
}

/// Returned by a [`MessageSink`](crate::sink::MessageSink) that could not accept a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Sink is closed")]
    Closed,
    #[error("Sink rejected the record: {0}")]
    Rejected(String),
}
