//! Pipeline runtime
//!
//! Wires the trigger and the three consumers to their queues. `run` starts
//! one worker pool per queue; `run_until_idle` drains every queue in stage
//! order until nothing is deliverable.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::consumers::{CloneVoiceConsumer, CreateOutputConsumer, TrainVoiceConsumer};
use crate::context::StageContext;
use crate::error::StageResult;
use crate::trigger::SampleIngestionTrigger;
use crate::worker::{JobDisposition, Worker};

pub struct Pipeline {
    pub trigger: Worker<SampleIngestionTrigger>,
    pub train_voice: Worker<TrainVoiceConsumer>,
    pub clone_voice: Worker<CloneVoiceConsumer>,
    pub create_output: Worker<CreateOutputConsumer>,
}

/// Per-stage dispositions from one `run_until_idle`
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    pub trigger: Vec<JobDisposition>,
    pub train_voice: Vec<JobDisposition>,
    pub clone_voice: Vec<JobDisposition>,
    pub create_output: Vec<JobDisposition>,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.trigger.len() + self.train_voice.len() + self.clone_voice.len() + self.create_output.len()
    }
}

impl Pipeline {
    pub fn new(ctx: StageContext) -> Self {
        let retry = ctx.config.retry.clone();
        let settings = ctx.config.worker.clone();
        let queue = ctx.queue.clone();

        Self {
            trigger: Worker::new(
                SampleIngestionTrigger::new(ctx.clone()),
                queue.clone(),
                retry.clone(),
                settings.clone(),
            ),
            train_voice: Worker::new(
                TrainVoiceConsumer::new(ctx.clone()),
                queue.clone(),
                retry.clone(),
                settings.clone(),
            ),
            clone_voice: Worker::new(
                CloneVoiceConsumer::new(ctx.clone()),
                queue.clone(),
                retry.clone(),
                settings.clone(),
            ),
            create_output: Worker::new(CreateOutputConsumer::new(ctx), queue, retry, settings),
        }
    }

    /// Run all worker pools until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!("Pipeline starting");
        tokio::join!(
            self.trigger.run(cancel.clone()),
            self.train_voice.run(cancel.clone()),
            self.clone_voice.run(cancel.clone()),
            self.create_output.run(cancel),
        );
        info!("Pipeline stopped");
    }

    /// Drain every queue repeatedly until a full pass processes nothing
    ///
    /// Messages waiting out a retry delay are not deliverable and end the
    /// drain; call again after the delay to continue.
    pub async fn run_until_idle(&self) -> StageResult<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let before = report.total();
            report.trigger.extend(self.trigger.drain().await?);
            report.train_voice.extend(self.train_voice.drain().await?);
            report.clone_voice.extend(self.clone_voice.drain().await?);
            report.create_output.extend(self.create_output.drain().await?);
            if report.total() == before {
                return Ok(report);
            }
        }
    }
}
