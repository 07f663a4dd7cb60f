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
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Changelog positions of one task: a version line followed by one
/// `<topic-partition> <offset>` line per changelog partition. The offset is
/// the next changelog record not yet reflected in the local stores.
#[derive(Debug)]
pub struct CheckpointFile {
    path: PathBuf,
    version: i8,
}

impl CheckpointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;
    pub const FILE_NAME: &'static str = ".checkpoint";

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    pub fn in_dir(task_dir: impl AsRef<Path>) -> Self {
        Self::new(task_dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes through a temporary file and renames it into place, so a crash
    /// never leaves a half written checkpoint.
    pub fn write(&self, points: &HashMap<TopicPartition, i64>) -> AppResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(format!("{}\n", self.version).as_bytes())?;
        for (topic_partition, offset) in points {
            writer.write_all(format!("{} {}\n", topic_partition.id(), offset).as_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        trace!("wrote {} checkpoints to {}", points.len(), self.path.display());
        Ok(())
    }

    /// Returns `None` when there is no checkpoint file.
    pub fn read(&self) -> AppResult<Option<HashMap<TopicPartition, i64>>> {
        let invalid = |what: &str| {
            AppError::InvalidArgument(format!("checkpoint {}: {}", self.path.display(), what))
        };
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let version = match lines.next() {
            Some(line) => line?.trim().parse::<i8>()?,
            None => return Err(invalid("empty file")),
        };
        if version != self.version {
            return Err(invalid(&format!("unsupported version {}", version)));
        }

        let mut points = HashMap::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(tp_str), Some(offset), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(invalid(&line));
            };
            let topic_partition = TopicPartition::from_string(Cow::Borrowed(tp_str))?;
            points.insert(topic_partition, offset.parse::<i64>()?);
        }
        Ok(Some(points))
    }

    pub fn delete(&self) -> AppResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to delete checkpoint {}: {}", self.path.display(), e);
                Err(e.into())
            }
        }
    }
}
