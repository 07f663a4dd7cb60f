// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Parses the `topic-partition` form; topics may contain `-` themselves.
    pub fn from_string(str_name: Cow<str>) -> AppResult<Self> {
        let (topic, partition) = str_name.rsplit_once('-').ok_or_else(|| {
            AppError::InvalidArgument(format!("topic partition name: {}", str_name))
        })?;
        if topic.is_empty() {
            return Err(AppError::InvalidArgument(format!(
                "topic partition name: {}",
                str_name
            )));
        }

        let partition = partition.parse().map_err(|_| {
            AppError::InvalidArgument(format!("topic partition id: {}", partition))
        })?;

        Ok(Self::new(topic, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_topic_with_dashes() {
        let tp = TopicPartition::from_string(Cow::Borrowed("app-store-changelog-3")).unwrap();
        assert_eq!(tp.topic(), "app-store-changelog");
        assert_eq!(tp.partition(), 3);
        assert_eq!(tp.to_string(), "app-store-changelog-3");
    }

    #[test]
    fn reject_malformed_names() {
        assert!(TopicPartition::from_string(Cow::Borrowed("nodash")).is_err());
        assert!(TopicPartition::from_string(Cow::Borrowed("topic-x")).is_err());
        assert!(TopicPartition::from_string(Cow::Borrowed("-1")).is_err());
    }
}
