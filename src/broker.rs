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

use crate::configs::ClientConfig;
use crate::error::BrokerError;
use crate::types::{MessageRecord, Offset, OffsetBounds, PartitionId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;
use std::sync::Arc;

/// An open read over one partition. Dropping it releases the underlying resources.
pub type RecordStream = BoxStream<'static, Result<MessageRecord, BrokerError>>;

/// The operations the consumers need from a broker client session.
#[async_trait]
pub trait Broker: Debug + Send + Sync {
    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError>;

    /// Earliest offset whose record timestamp is greater than or equal to `timestamp`,
    /// or `None` when every record in the partition is older.
    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp: i64,
    ) -> Result<Option<Offset>, BrokerError>;

    async fn offset_bounds(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<OffsetBounds, BrokerError>;

    /// Opens a stream that yields records starting at the concrete `offset`
    /// until it is dropped or faults.
    async fn open_stream(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<RecordStream, BrokerError>;
}

/// Establishes a broker session for a set of addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        addresses: &[String],
        config: &ClientConfig,
    ) -> Result<Arc<dyn Broker>, BrokerError>;
}
