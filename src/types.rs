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

use crate::configs::StartPolicy;
use crate::error::ConsumerError;
use bytes::Bytes;
use std::fmt;

pub type PartitionId = u32;
pub type Offset = i64;

/// Sentinel offset meaning "the oldest offset still available in the partition".
pub const OFFSET_OLDEST: Offset = -2;
/// Sentinel offset meaning "the tail of the partition", one past the last written record.
pub const OFFSET_NEWEST: Offset = -1;

/// Where consumption of every partition of a topic should begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Oldest,
    Newest,
    /// Unix timestamp in milliseconds.
    Timestamp(i64),
    /// The same concrete offset for every partition.
    Offset(Offset),
}

impl StartPosition {
    /// Interprets a raw start value the way the client is configured to.
    /// Both sentinels are accepted regardless of the policy.
    pub fn from_raw(value: i64, policy: StartPolicy) -> Result<Self, ConsumerError> {
        match value {
            OFFSET_OLDEST => Ok(StartPosition::Oldest),
            OFFSET_NEWEST => Ok(StartPosition::Newest),
            value if value < 0 => Err(ConsumerError::InvalidStartPosition(value)),
            value => Ok(match policy {
                StartPolicy::Timestamp => StartPosition::Timestamp(value),
                StartPolicy::Offset => StartPosition::Offset(value),
            }),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Oldest => write!(f, "oldest"),
            StartPosition::Newest => write!(f, "newest"),
            StartPosition::Timestamp(timestamp) => write!(f, "timestamp {timestamp}"),
            StartPosition::Offset(offset) => write!(f, "offset {offset}"),
        }
    }
}

/// Range of offsets currently readable from a partition.
/// `newest` is the offset the next appended record will get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetBounds {
    pub oldest: Offset,
    pub newest: Offset,
}

impl OffsetBounds {
    pub fn is_empty(&self) -> bool {
        self.oldest >= self.newest
    }

    pub fn contains(&self, offset: Offset) -> bool {
        offset >= self.oldest && offset <= self.newest
    }
}

/// A single record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}
