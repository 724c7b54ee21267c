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

use crate::error::ConsumerError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::path::Path;
use std::time::Duration;
use strum::Display;
use tracing::info;

const ENV_PREFIX: &str = "KAFKA_CONSUMER_";

/// What a partition loop does with an error that concerns a single record
/// (a broker-side read error or a sink rejection).
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Log the error and move on to the next record.
    #[default]
    #[strum(to_string = "log")]
    Log,
    /// Hand the error to the sink's error hook and move on.
    #[strum(to_string = "return")]
    Return,
    /// Stop consuming the partition.
    #[strum(to_string = "fatal")]
    Fatal,
}

/// How a non-negative start value passed to `subscribe_topics` is read.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    #[default]
    #[strum(to_string = "timestamp")]
    Timestamp,
    #[strum(to_string = "offset")]
    Offset,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub error_mode: ErrorMode,
    pub start_policy: StartPolicy,
    #[serde_as(as = "DisplayFromStr")]
    pub connect_timeout: humantime::Duration,
    /// How long an in-flight delivery may keep running once its partition is closed.
    #[serde_as(as = "DisplayFromStr")]
    pub close_timeout: humantime::Duration,
    pub channel_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: "kafka-consumer".to_owned(),
            error_mode: ErrorMode::default(),
            start_policy: StartPolicy::default(),
            connect_timeout: Duration::from_secs(10).into(),
            close_timeout: Duration::from_secs(5).into(),
            channel_buffer_size: 256,
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from the defaults, then the optional TOML file,
    /// then `KAFKA_CONSUMER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConsumerError> {
        let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConsumerError::InvalidConfiguration(format!(
                    "configuration file: {} does not exist",
                    path.display()
                )));
            }
            info!("Loading consumer configuration from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        let config: ClientConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|error| ConsumerError::InvalidConfiguration(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.client_id.is_empty() {
            return Err(ConsumerError::InvalidConfiguration(
                "client_id cannot be empty".to_owned(),
            ));
        }
        if self.channel_buffer_size == 0 {
            return Err(ConsumerError::InvalidConfiguration(
                "channel_buffer_size must be greater than 0".to_owned(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConsumerError::InvalidConfiguration(
                "connect_timeout must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn should_use_defaults_without_file() {
        let config = ClientConfig::load(None).unwrap();
        assert_eq!(config.client_id, "kafka-consumer");
        assert_eq!(config.error_mode, ErrorMode::Log);
        assert_eq!(config.start_policy, StartPolicy::Timestamp);
        assert_eq!(*config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.channel_buffer_size, 256);
    }

    #[test]
    fn should_load_values_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
brokers = ["10.0.0.1:9092", "10.0.0.2:9092"]
client_id = "orders-reader"
error_mode = "return"
start_policy = "offset"
connect_timeout = "3s"
close_timeout = "250ms"
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.client_id, "orders-reader");
        assert_eq!(config.error_mode, ErrorMode::Return);
        assert_eq!(config.start_policy, StartPolicy::Offset);
        assert_eq!(*config.connect_timeout, Duration::from_secs(3));
        assert_eq!(*config.close_timeout, Duration::from_millis(250));
        assert_eq!(config.channel_buffer_size, 256);
    }

    #[test]
    fn should_fail_for_missing_file() {
        let result = ClientConfig::load(Some(Path::new("/nonexistent/consumer.toml")));
        assert!(matches!(result, Err(ConsumerError::InvalidConfiguration(_))));
    }

    #[test]
    fn should_reject_unknown_error_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"error_mode = "panic""#).unwrap();

        let result = ClientConfig::load(Some(file.path()));
        assert!(matches!(result, Err(ConsumerError::InvalidConfiguration(_))));
    }

    #[test]
    fn should_reject_zero_channel_buffer() {
        let config = ClientConfig {
            channel_buffer_size: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
