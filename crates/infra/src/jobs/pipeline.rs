//! Caller-facing entry points: enqueue, inspect, and direct reads.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use recordchain_core::{ErrorClass, IdentityRef, JobId, OrgId, TxId, ValidationCode};
use recordchain_ledger::{
    BrokerError, CommitConfirmer, ConfirmError, GatewayOptions, NetworkBroker, SubmissionClient, SubmitError,
};

use super::queue::JobQueue;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobSummary, RetryPolicy};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown organization: {0}")]
    UnknownOrg(OrgId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

impl PipelineError {
    /// Ledger error class, for failures that came from the ledger side.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            PipelineError::Broker(e) => Some(e.class()),
            PipelineError::Submit(e) => Some(e.class()),
            PipelineError::Confirm(ConfirmError::Query(e)) => Some(e.class()),
            _ => None,
        }
    }
}

/// The submission pipeline shared by the HTTP layer, the worker pool and
/// the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SubmitPipeline {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) broker: Arc<NetworkBroker>,
    pub(crate) client: SubmissionClient,
    pub(crate) confirmer: CommitConfirmer,
    retry: RetryPolicy,
}

impl SubmitPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        broker: Arc<NetworkBroker>,
        options: &GatewayOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            broker,
            client: SubmissionClient::new(options),
            confirmer: CommitConfirmer::new(options),
            retry,
        }
    }

    pub fn broker(&self) -> &Arc<NetworkBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    fn check_org(&self, identity: &IdentityRef) -> Result<(), PipelineError> {
        if !self.broker.knows_org(identity.org_id()) {
            return Err(PipelineError::UnknownOrg(identity.org_id().clone()));
        }
        Ok(())
    }

    /// Persist a new job as `queued` and make it visible to workers.
    pub async fn enqueue(
        &self,
        identity: IdentityRef,
        tx_name: &str,
        args: Vec<String>,
    ) -> Result<JobId, PipelineError> {
        self.check_org(&identity)?;
        let tx_name = tx_name.trim();
        if tx_name.is_empty() {
            return Err(PipelineError::InvalidRequest("transaction name is empty".to_string()));
        }

        let job = Job::new(identity, tx_name, args, self.retry, Utc::now());
        let id = job.id;
        let identity = job.identity.to_string();
        self.store.insert(job).await?;
        self.queue.push(id).await?;

        info!(job_id = %id, identity = %identity, tx_name, "job enqueued");
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobSummary, PipelineError> {
        self.store
            .get(id)
            .await?
            .map(|job| job.summary())
            .ok_or(PipelineError::JobNotFound(id))
    }

    pub async fn stats(&self) -> Result<JobStats, PipelineError> {
        Ok(self.store.stats().await?)
    }

    /// Read-only call that bypasses the queue.
    pub async fn evaluate(
        &self,
        identity: &IdentityRef,
        tx_name: &str,
        args: &[String],
    ) -> Result<Vec<u8>, PipelineError> {
        self.check_org(identity)?;
        let handle = self.broker.get_handle(identity).await?;
        let result = self.client.evaluate(&handle, tx_name, args).await;
        if let Err(e) = &result {
            if e.class() == ErrorClass::ConnectionError {
                self.broker.invalidate(&handle).await;
            }
        }
        Ok(result?)
    }

    /// Validation code of a transaction, looked up through `identity`.
    pub async fn transaction_status(
        &self,
        identity: &IdentityRef,
        tx_id: &TxId,
    ) -> Result<ValidationCode, PipelineError> {
        self.check_org(identity)?;
        let handle = self.broker.get_handle(identity).await?;
        Ok(self.confirmer.validation_code(&handle, tx_id).await?)
    }

    /// Chain height as seen by every configured organization.
    pub async fn block_heights(&self) -> Vec<(OrgId, Result<u64, PipelineError>)> {
        let mut heights = Vec::new();
        for org in self.broker.org_ids() {
            let height = async {
                let handle = self.broker.get_handle(&IdentityRef::org(org.clone())).await?;
                Ok::<_, PipelineError>(self.confirmer.block_height(&handle).await?)
            }
            .await;
            debug!(org = %org, ok = height.is_ok(), "checked block height");
            heights.push((org, height));
        }
        heights
    }
}
