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

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{ClientSupplier, Producer, ProducerConfig};
use crate::{AppError, AppResult, ProcessingGuarantee};

use super::TaskId;

/// Hands producers to active tasks.
///
/// At-least-once: every task shares the producer created with the registry,
/// which lives until [`ProducerRegistry::close_shared`]. Exactly-once: each
/// task gets its own transactional producer, fenced by its transactional id
/// `<application_id>-<task_id>` and closed together with the task.
#[derive(Debug)]
pub struct ProducerRegistry {
    guarantee: ProcessingGuarantee,
    application_id: String,
    client_id: String,
    supplier: Arc<dyn ClientSupplier>,
    shared: Option<Arc<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new(
        guarantee: ProcessingGuarantee,
        application_id: impl Into<String>,
        client_id: impl Into<String>,
        supplier: Arc<dyn ClientSupplier>,
    ) -> Self {
        let client_id = client_id.into();
        let shared = match guarantee {
            ProcessingGuarantee::AtLeastOnce => {
                info!("{} creating shared producer", client_id);
                Some(supplier.get_producer(&ProducerConfig {
                    client_id: format!("{}-producer", client_id),
                    transactional_id: None,
                }))
            }
            ProcessingGuarantee::ExactlyOnce => None,
        };
        Self {
            guarantee,
            application_id: application_id.into(),
            client_id,
            supplier,
            shared,
        }
    }

    pub fn guarantee(&self) -> ProcessingGuarantee {
        self.guarantee
    }

    pub fn transactional_id(&self, task_id: TaskId) -> String {
        format!("{}-{}", self.application_id, task_id)
    }

    /// Producer for a new active task. A transactional producer is returned
    /// with transactions initialized and the first transaction begun; if
    /// that fails it is closed before the error is returned.
    pub fn producer_for(&self, task_id: TaskId) -> AppResult<Arc<dyn Producer>> {
        match self.guarantee {
            ProcessingGuarantee::AtLeastOnce => self.shared.clone().ok_or_else(|| {
                AppError::IllegalStateTransition(format!(
                    "{} shared producer already closed",
                    self.client_id
                ))
            }),
            ProcessingGuarantee::ExactlyOnce => {
                let transactional_id = self.transactional_id(task_id);
                let producer = self.supplier.get_producer(&ProducerConfig {
                    client_id: format!("{}-{}-producer", self.client_id, task_id),
                    transactional_id: Some(transactional_id.clone()),
                });
                let initialized = producer
                    .init_transactions()
                    .and_then(|_| producer.begin_transaction());
                if let Err(e) = initialized {
                    warn!(
                        "transactional producer {} failed to initialize: {}",
                        transactional_id, e
                    );
                    if let Err(close_err) = producer.close() {
                        debug!("closing producer {} failed: {}", transactional_id, close_err);
                    }
                    return Err(e);
                }
                debug!("created transactional producer {}", transactional_id);
                Ok(producer)
            }
        }
    }

    pub fn shared_producer(&self) -> Option<&Arc<dyn Producer>> {
        self.shared.as_ref()
    }

    /// Closes the shared producer. Calling it again is a no-op; calling it
    /// with exactly-once is a contract violation since there is none.
    pub fn close_shared(&mut self) -> AppResult<()> {
        if self.guarantee == ProcessingGuarantee::ExactlyOnce {
            return Err(AppError::IllegalStateTransition(
                "no shared producer with exactly-once processing".to_string(),
            ));
        }
        if let Some(producer) = self.shared.take() {
            info!("{} closing shared producer", self.client_id);
            producer.close()?;
        }
        Ok(())
    }
}
