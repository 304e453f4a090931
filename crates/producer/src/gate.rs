use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::capability::Capability;
use super::error::{GateClosedSnafu, ProducerResult};

pub const DEFAULT_CEILING: usize = 3;

/// Counting gate bounding how many calls to one capability are in flight.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    capability: Capability,
    ceiling: usize,
    semaphore: Arc<Semaphore>,
}

impl AdmissionGate {
    pub fn new(capability: Capability, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            capability,
            ceiling,
            semaphore: Arc::new(Semaphore::new(ceiling)),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.ceiling - self.semaphore.available_permits()
    }

    /// Suspends until a unit is free. The unit returns to the gate when the permit drops.
    pub async fn acquire(&self) -> ProducerResult<AdmissionPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context(GateClosedSnafu {
                stage: "admission-acquire",
                capability: self.capability,
            })?;

        tracing::debug!(
            capability = %self.capability,
            in_flight = self.in_flight(),
            ceiling = self.ceiling,
            "admission granted"
        );

        Ok(AdmissionPermit {
            capability: self.capability,
            _permit: permit,
        })
    }
}

#[derive(Debug)]
pub struct AdmissionPermit {
    capability: Capability,
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        tracing::trace!(capability = %self.capability, "admission released");
    }
}
