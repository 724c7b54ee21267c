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
use crate::error::{BrokerError, ConsumerError};
use crate::types::{OFFSET_NEWEST, OFFSET_OLDEST, Offset, PartitionId, StartPosition};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Turns a start position into a starting offset for every partition of a topic.
#[derive(Debug, Clone)]
pub struct OffsetResolver {
    broker: Arc<dyn Broker>,
}

impl OffsetResolver {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Sentinel positions are passed through unchanged and only need the partition list;
    /// they are turned into concrete offsets when the partition is opened.
    pub async fn resolve(
        &self,
        topic: &str,
        position: StartPosition,
    ) -> Result<BTreeMap<PartitionId, Offset>, ConsumerError> {
        let partitions = self
            .broker
            .partitions(topic)
            .await
            .map_err(|error| match error {
                BrokerError::Unreachable(reason) => ConsumerError::Connectivity(reason),
                BrokerError::UnknownTopic => ConsumerError::TopicNotFound(topic.to_owned()),
                error => ConsumerError::OffsetResolution {
                    topic: topic.to_owned(),
                    partition: None,
                    reason: error.to_string(),
                },
            })?;

        let offsets: BTreeMap<PartitionId, Offset> = match position {
            StartPosition::Oldest => Self::fill(&partitions, OFFSET_OLDEST),
            StartPosition::Newest => Self::fill(&partitions, OFFSET_NEWEST),
            StartPosition::Offset(offset) => Self::fill(&partitions, offset),
            StartPosition::Timestamp(timestamp) => {
                let lookups = partitions
                    .iter()
                    .map(|&partition| self.resolve_timestamp(topic, partition, timestamp));
                try_join_all(lookups).await?.into_iter().collect()
            }
        };
        debug!("Resolved {position} for topic: {topic} to offsets: {offsets:?}");
        Ok(offsets)
    }

    async fn resolve_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        timestamp: i64,
    ) -> Result<(PartitionId, Offset), ConsumerError> {
        let map_error = |error: BrokerError| match error {
            BrokerError::Unreachable(reason) => ConsumerError::Connectivity(reason),
            BrokerError::UnknownTopic => ConsumerError::TopicNotFound(topic.to_owned()),
            error => ConsumerError::OffsetResolution {
                topic: topic.to_owned(),
                partition: Some(partition),
                reason: error.to_string(),
            },
        };

        if let Some(offset) = self
            .broker
            .offset_for_timestamp(topic, partition, timestamp)
            .await
            .map_err(map_error)?
        {
            return Ok((partition, offset));
        }

        // Every record is older than the timestamp, or there are no records at all.
        let bounds = self
            .broker
            .offset_bounds(topic, partition)
            .await
            .map_err(map_error)?;
        let offset = if bounds.is_empty() {
            bounds.oldest
        } else {
            bounds.newest
        };
        Ok((partition, offset))
    }

    fn fill(partitions: &[PartitionId], offset: Offset) -> BTreeMap<PartitionId, Offset> {
        partitions
            .iter()
            .map(|&partition| (partition, offset))
            .collect()
    }
}
