use crate::blob_store::{BlobStore, BlobStoreError};
use crate::record_store::{RecordStore, RecordStoreError, TransactionStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// One deposit attempt. Exists only for the duration of a single
/// pipeline invocation.
#[derive(Debug, Clone)]
pub struct DepositRequest {
    /// Verified external user id, supplied by the identity layer
    pub external_user_id: String,
    /// Raw image bytes
    pub image_bytes: Vec<u8>,
    /// Original filename, used only for extension/content-type inference
    pub filename: String,
}

/// Result of a completed deposit. The object key is deliberately absent:
/// it is an internal compensation handle, retrievable later from the
/// transaction row's metadata.
#[derive(Debug, Clone)]
pub struct DepositOutcome {
    pub transaction_id: Uuid,
    pub image_url: String,
    pub status: TransactionStatus,
}

/// Classified deposit failures. Every external-call failure is caught at
/// the pipeline boundary and mapped to one of these kinds; none propagate
/// unclassified.
#[derive(Error, Debug)]
pub enum DepositError {
    #[error("invalid deposit request: {0}")]
    InvalidRequest(String),

    #[error("image upload failed: {0}")]
    UploadFailed(#[source] BlobStoreError),

    #[error("user resolution failed: {0}")]
    UserResolutionFailed(#[source] RecordStoreError),

    #[error("transaction insert failed: {0}")]
    TransactionInsertFailed(#[source] RecordStoreError),

    #[error("deposit cancelled before completion")]
    Cancelled,
}

impl DepositError {
    /// Stable error kind reported to callers
    pub fn kind(&self) -> &'static str {
        match self {
            DepositError::InvalidRequest(_) => "InvalidRequest",
            DepositError::UploadFailed(_) => "UploadFailed",
            DepositError::UserResolutionFailed(_) => "UserResolutionFailed",
            DepositError::TransactionInsertFailed(_) => "TransactionInsertFailed",
            DepositError::Cancelled => "Cancelled",
        }
    }
}

/// Pipeline phases, in order. Failures after `Uploaded` trigger
/// compensation before the error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DepositPhase {
    Received,
    Uploading,
    Uploaded,
    UserResolving,
    UserResolved,
    RecordInserting,
    Completed,
}

/// Orchestrates one deposit: blob upload, user resolution, transaction
/// insert, with best-effort rollback of the upload when a later step fails.
///
/// Storage goes first on purpose: an orphaned blob is cheaper to leave
/// behind than a transaction row pointing at a nonexistent object, so the
/// record insert is always last.
pub struct DepositPipeline {
    blob_store: Arc<dyn BlobStore>,
    record_store: Arc<dyn RecordStore>,
}

impl DepositPipeline {
    /// Create a pipeline over explicitly constructed, caller-owned clients
    pub fn new(blob_store: Arc<dyn BlobStore>, record_store: Arc<dyn RecordStore>) -> Self {
        Self {
            blob_store,
            record_store,
        }
    }

    /// Run one deposit to completion or a classified failure.
    ///
    /// The three external calls run sequentially; each step's success is a
    /// precondition for the next. Cancellation aborts remaining steps and,
    /// once an object has been uploaded, runs compensation first.
    #[instrument(skip(self, request, cancel), fields(external_user_id = %request.external_user_id, filename = %request.filename))]
    pub async fn deposit(
        &self,
        request: DepositRequest,
        cancel: CancellationToken,
    ) -> Result<DepositOutcome, DepositError> {
        let mut phase = DepositPhase::Received;

        if request.external_user_id.is_empty() {
            return Err(self.reject(
                phase,
                DepositError::InvalidRequest("external user id is empty".to_string()),
            ));
        }
        if request.image_bytes.is_empty() {
            return Err(self.reject(
                phase,
                DepositError::InvalidRequest("image payload is empty".to_string()),
            ));
        }

        phase = DepositPhase::Uploading;
        let stored = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Nothing uploaded yet, nothing to roll back.
                return Err(self.reject(phase, DepositError::Cancelled));
            }
            result = self.blob_store.upload(
                &request.image_bytes,
                &request.filename,
                &request.external_user_id,
            ) => {
                result.map_err(|e| self.reject(phase, DepositError::UploadFailed(e)))?
            }
        };

        phase = DepositPhase::Uploaded;
        debug!(
            object_key = %stored.key,
            phase = ?phase,
            "Image uploaded, holding key for compensation"
        );

        phase = DepositPhase::UserResolving;
        let user = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.abort(phase, &stored.key, DepositError::Cancelled).await);
            }
            result = self.record_store.create_user_if_absent(&request.external_user_id) => {
                match result {
                    Ok(user) => user,
                    Err(e) => {
                        return Err(self
                            .abort(phase, &stored.key, DepositError::UserResolutionFailed(e))
                            .await);
                    }
                }
            }
        };

        phase = DepositPhase::UserResolved;
        debug!(user_id = %user.id, phase = ?phase, "User resolved");

        phase = DepositPhase::RecordInserting;
        let transaction = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.abort(phase, &stored.key, DepositError::Cancelled).await);
            }
            result = self.record_store.insert_transaction(
                user.id,
                &stored.signed_url,
                &stored.key,
                TransactionStatus::Pending,
                None,
            ) => {
                match result {
                    Ok(transaction) => transaction,
                    Err(e) => {
                        return Err(self
                            .abort(phase, &stored.key, DepositError::TransactionInsertFailed(e))
                            .await);
                    }
                }
            }
        };

        phase = DepositPhase::Completed;
        metrics::counter!("deposit.completed").increment(1);
        info!(
            transaction_id = %transaction.id,
            object_key = %stored.key,
            phase = ?phase,
            "Deposit completed"
        );

        Ok(DepositOutcome {
            transaction_id: transaction.id,
            image_url: stored.signed_url,
            status: TransactionStatus::Pending,
        })
    }

    /// Classify and log a failure with nothing to roll back
    fn reject(&self, phase: DepositPhase, error: DepositError) -> DepositError {
        metrics::counter!("deposit.failed", "kind" => error.kind()).increment(1);
        warn!(phase = ?phase, kind = error.kind(), error = %error, "Deposit failed");
        error
    }

    /// Compensate the held object key, then surface the triggering error.
    /// Compensation runs exactly once and its outcome never changes the
    /// error kind the caller sees.
    async fn abort(
        &self,
        phase: DepositPhase,
        object_key: &str,
        error: DepositError,
    ) -> DepositError {
        self.compensate(object_key).await;
        self.reject(phase, error)
    }

    async fn compensate(&self, object_key: &str) {
        metrics::counter!("deposit.compensations").increment(1);
        if self.blob_store.delete(object_key).await {
            info!(object_key = %object_key, "Compensation delete succeeded");
        } else {
            metrics::counter!("deposit.compensations.failed").increment(1);
            warn!(
                object_key = %object_key,
                "Compensation delete failed, orphaned object remains for garbage collection"
            );
        }
    }
}
