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

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::AppError;

/// Identity of one unit of partition-parallel work: the sub-topology group
/// and the input partition index it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub group_id: i32,
    pub partition: i32,
}

impl TaskId {
    pub const fn new(group_id: i32, partition: i32) -> Self {
        Self {
            group_id,
            partition,
        }
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.group_id, self.partition)
    }
}

impl FromStr for TaskId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InvalidArgument(format!("task id: {}", s));
        let (group, partition) = s.split_once('_').ok_or_else(invalid)?;
        let group_id = group.parse().map_err(|_| invalid())?;
        let partition = partition.parse().map_err(|_| invalid())?;
        Ok(Self::new(group_id, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = TaskId::new(1, 7);
        assert_eq!(id.to_string(), "1_7");
        assert_eq!("1_7".parse::<TaskId>().unwrap(), id);
        assert!("17".parse::<TaskId>().is_err());
        assert!("a_1".parse::<TaskId>().is_err());
    }

    #[test]
    fn ordered_by_group_then_partition() {
        let mut ids = vec![TaskId::new(1, 0), TaskId::new(0, 2), TaskId::new(0, 1)];
        ids.sort();
        assert_eq!(
            ids,
            vec![TaskId::new(0, 1), TaskId::new(0, 2), TaskId::new(1, 0)]
        );
    }
}
