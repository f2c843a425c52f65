//! Fire-and-forget background work. One worker drains an unbounded queue;
//! a failed job is logged and dropped.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::images::ImageStore;
use crate::mailer::{Email, Mailer};

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    SendEmail(Email),
    DeleteImage { public_id: String },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::SendEmail(_) => "send_email",
            Job::DeleteImage { .. } => "delete_image",
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Spawns the worker. It stops once every handle has been dropped.
    pub fn start(mailer: Arc<dyn Mailer>, images: Arc<dyn ImageStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let kind = job.kind();
                match run(job, mailer.as_ref(), images.as_ref()).await {
                    Ok(()) => tracing::debug!(kind, "job done"),
                    Err(e) => tracing::warn!(kind, error = %format!("{e:#}"), "job failed"),
                }
            }
            tracing::debug!("job queue closed");
        });
        Self { tx }
    }

    pub fn enqueue(&self, job: Job) {
        if let Err(e) = self.tx.send(job) {
            tracing::warn!(kind = e.0.kind(), "job queue closed, dropping job");
        }
    }
}

async fn run(job: Job, mailer: &dyn Mailer, images: &dyn ImageStore) -> anyhow::Result<()> {
    match job {
        Job::SendEmail(email) => mailer.send(&email).await,
        Job::DeleteImage { public_id } => images.delete(&public_id).await,
    }
}
