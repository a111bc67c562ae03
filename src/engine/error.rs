use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced by the scheduling pipeline. `Validation` and `NotFound`
/// carry user-facing text; nothing was written when either is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Falha ao se comunicar com o banco de dados.")]
    StoreCommunication,
}

impl ScheduleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ScheduleError::Validation(msg.into())
    }
}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotTaken(id) => {
                metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL, "stage" => "store")
                    .increment(1);
                tracing::info!(conflicting = %id, "slot precondition failed");
                ScheduleError::Validation(super::conflict::CONFLICT_MESSAGE.to_string())
            }
            StoreError::NotFound(id) => {
                tracing::warn!(%id, "document vanished during write");
                ScheduleError::NotFound(super::ORIGINAL_MISSING_MESSAGE.to_string())
            }
            other => {
                metrics::counter!(crate::observability::STORE_ERRORS_TOTAL).increment(1);
                tracing::error!("store failure: {other}");
                ScheduleError::StoreCommunication
            }
        }
    }
}
