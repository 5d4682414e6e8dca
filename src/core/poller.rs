//! Status polling for sent transfers.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive;
use super::models::Transfer;
use super::state::TransferState;
use crate::context::AppContext;
use crate::db::{self, artifacts::NewArtifact};
use crate::error::{ErrorKind, Result, TransferError};
use crate::remote::StatusResponse;

const CONFIRMATION_FILE_NAME: &str = "confirmation.xml";

/// What a status answer means for the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Confirmed { receipt: String },
    Declined,
    InProgress,
}

/// Result of polling one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not in `sent`, or another operation holds the transfer.
    Skipped,
    InProgress,
    Confirmed,
    Declined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub confirmed: usize,
    pub declined: usize,
    pub in_progress: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// `200` with a receipt confirms, anything above `400` declines, everything
/// else (including `200` without a receipt) is still in progress.
pub fn classify(status: &StatusResponse) -> Verdict {
    match status.code {
        200 => match status.upo.as_deref() {
            Some(receipt) if !receipt.is_empty() => Verdict::Confirmed {
                receipt: receipt.to_string(),
            },
            _ => Verdict::InProgress,
        },
        code if code > 400 => Verdict::Declined,
        _ => Verdict::InProgress,
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    ctx: AppContext,
}

impl StatusPoller {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Poll one transfer, waiting for any running operation on it.
    pub async fn poll(&self, transfer_id: &str) -> Result<PollOutcome> {
        let _guard = self.ctx.locks.acquire(transfer_id).await;
        self.poll_transfer(transfer_id).await
    }

    /// Poll without taking the transfer lock. Callers hold it.
    ///
    /// A status call that cannot be completed declines the transfer with the
    /// raw response text as its error description and returns
    /// [`TransferError::PollDecline`].
    pub async fn poll_transfer(&self, transfer_id: &str) -> Result<PollOutcome> {
        let transfer = db::transfers::get(&self.ctx.db, transfer_id.to_string())
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))?;

        if !transfer.state.can_poll() {
            debug!(transfer_id, state = %transfer.state, "Not sent, skipping status check");
            return Ok(PollOutcome::Skipped);
        }

        let reference_number = transfer.reference_number.clone().ok_or_else(|| {
            TransferError::validation("JPK Transfer has no reference number")
        })?;

        let status = match self.fetch_status(&reference_number).await {
            Ok(status) => status,
            Err(e) if e.kind() == ErrorKind::Validation => return Err(e),
            Err(e) => {
                let text = e.response_text();
                warn!(transfer_id, error = %e, "Status check failed, declining transfer");
                db::transfers::decline(&self.ctx.db, transfer.id.clone(), Some(text.clone()))
                    .await?;
                return Err(TransferError::PollDecline(text));
            }
        };

        self.apply(&transfer, status).await
    }

    async fn fetch_status(&self, reference_number: &str) -> Result<StatusResponse> {
        let retries = self.ctx.config.status_retry_attempts;
        let delay = Duration::from_millis(self.ctx.config.status_retry_delay_ms);

        let mut attempt = 0;
        loop {
            match self.ctx.remote.status(reference_number).await {
                Ok(status) => return Ok(status),
                Err(e) if e.kind() != ErrorKind::Validation && attempt < retries => {
                    attempt += 1;
                    warn!(
                        %reference_number,
                        attempt,
                        retries,
                        error = %e,
                        "Status check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply(&self, transfer: &Transfer, status: StatusResponse) -> Result<PollOutcome> {
        let db = &self.ctx.db;

        if status.description != transfer.last_description {
            if let Some(description) = &status.description {
                db::transfers::add_message(
                    db,
                    transfer.id.clone(),
                    format!("Check request status: {description}"),
                )
                .await?;
                db::transfers::set_last_description(db, transfer.id.clone(), description.clone())
                    .await?;
            }
        }

        match classify(&status) {
            Verdict::Confirmed { receipt } => {
                let hash = archive::sha256_base64(receipt.as_bytes());
                let confirmation_id = db::artifacts::create(
                    db,
                    NewArtifact::new(CONFIRMATION_FILE_NAME, receipt.into_bytes()).with_hash(hash),
                )
                .await?;
                db::transfers::confirm(db, transfer.id.clone(), confirmation_id).await?;

                info!(transfer_id = %transfer.id, "Transfer confirmed");
                Ok(PollOutcome::Confirmed)
            }
            Verdict::Declined => {
                db::transfers::add_message(
                    db,
                    transfer.id.clone(),
                    format!(
                        "Check request status: [{}] {}",
                        status.code,
                        status.description.as_deref().unwrap_or_default()
                    ),
                )
                .await?;
                db::transfers::decline(db, transfer.id.clone(), None).await?;

                info!(transfer_id = %transfer.id, code = status.code, "Transfer declined");
                Ok(PollOutcome::Declined)
            }
            Verdict::InProgress => {
                debug!(transfer_id = %transfer.id, code = status.code, "Transfer still processing");
                Ok(PollOutcome::InProgress)
            }
        }
    }

    /// Poll every active sent transfer once. Per-transfer failures are logged
    /// and counted; transfers busy with another operation are skipped.
    pub async fn poll_all(&self) -> Result<PollSummary> {
        let ids = db::transfers::ids_in_state(&self.ctx.db, TransferState::Sent).await?;
        let mut summary = PollSummary::default();

        for id in ids {
            let Some(_guard) = self.ctx.locks.try_acquire(&id).await else {
                debug!(transfer_id = %id, "Transfer busy, skipping");
                summary.skipped += 1;
                continue;
            };

            summary.polled += 1;
            match self.poll_transfer(&id).await {
                Ok(PollOutcome::Confirmed) => summary.confirmed += 1,
                Ok(PollOutcome::Declined) => summary.declined += 1,
                Ok(PollOutcome::InProgress) => summary.in_progress += 1,
                Ok(PollOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(transfer_id = %id, error = %e, "Status check failed");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Poll on a fixed interval until cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Status poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_all().await {
                        Ok(summary) if summary.polled > 0 => info!(?summary, "Poll cycle complete"),
                        Ok(_) => debug!("No sent transfers to poll"),
                        Err(e) => error!(error = %e, "Poll cycle failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Status poller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: i32, upo: Option<&str>) -> StatusResponse {
        StatusResponse {
            code,
            description: Some("d".into()),
            upo: upo.map(str::to_string),
        }
    }

    #[test]
    fn classifies_status_codes() {
        assert_eq!(
            classify(&status(200, Some("<xml/>"))),
            Verdict::Confirmed {
                receipt: "<xml/>".into()
            }
        );
        assert_eq!(classify(&status(200, None)), Verdict::InProgress);
        assert_eq!(classify(&status(200, Some(""))), Verdict::InProgress);
        assert_eq!(classify(&status(120, None)), Verdict::InProgress);
        assert_eq!(classify(&status(400, None)), Verdict::InProgress);
        assert_eq!(classify(&status(401, None)), Verdict::Declined);
        assert_eq!(classify(&status(450, None)), Verdict::Declined);
    }
}
