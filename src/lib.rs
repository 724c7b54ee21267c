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

//! Consumption of partitioned, log-based topics.
//!
//! A [`ConsumerClient`] subscribes topics from a timestamp, an offset or one of
//! the offset sentinels, runs one consumption task per partition and stops all
//! of a topic's partitions with a single [`ConsumerClient::stop_topic`] call.
//! The broker itself is reached through the [`Broker`] and [`Connector`]
//! traits; [`memory::MemoryCluster`] provides an in-process implementation.

pub mod broker;
pub mod client;
pub mod configs;
pub mod error;
pub mod manager;
pub mod memory;
pub mod offsets;
pub mod partition;
pub mod sink;
pub mod types;

pub use broker::{Broker, Connector, RecordStream};
pub use client::ConsumerClient;
pub use configs::{ClientConfig, ErrorMode, StartPolicy};
pub use error::{BrokerError, ConsumerError, SinkError};
pub use manager::group::{TopicConsumerGroup, TopicReport};
pub use offsets::OffsetResolver;
pub use partition::{PartitionConsumer, PartitionSummary, StopReason};
pub use sink::{ChannelSink, ConsumerEvent, MessageSink};
pub use types::{
    MessageRecord, OFFSET_NEWEST, OFFSET_OLDEST, Offset, OffsetBounds, PartitionId, StartPosition,
};
