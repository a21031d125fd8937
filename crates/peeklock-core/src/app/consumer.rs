//! Consumer - AdmissionController と ReceivePipeline を一緒に動かす

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionController, AdmissionSnapshot, RunExit, WorkRequests};
use super::pipeline::ReceivePipeline;

/// A fully wired consumer, not yet running.
#[derive(Debug)]
pub struct Consumer {
    controller: Arc<AdmissionController>,
    pipeline: ReceivePipeline,
    requests: WorkRequests,
    cancel: CancellationToken,
}

impl Consumer {
    pub(crate) fn new(
        controller: Arc<AdmissionController>,
        pipeline: ReceivePipeline,
        requests: WorkRequests,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller,
            pipeline,
            requests,
            cancel,
        }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Spawn the dispatch loop and the pipeline.
    pub fn start(self) -> ConsumerHandle {
        let Self {
            controller,
            pipeline,
            requests,
            cancel,
        } = self;
        let intake = cancel.child_token();

        let dispatcher = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run().await }
        });
        let server = tokio::spawn({
            let pipeline = pipeline.clone();
            let intake = intake.clone();
            async move { pipeline.serve(requests, intake).await }
        });

        ConsumerHandle {
            controller,
            pipeline,
            cancel,
            intake,
            dispatcher,
            server,
        }
    }
}

/// Handle to a running consumer.
///
/// Dropping the handle does not stop the consumer; call `shutdown()`.
#[derive(Debug)]
pub struct ConsumerHandle {
    controller: Arc<AdmissionController>,
    pipeline: ReceivePipeline,
    cancel: CancellationToken,
    intake: CancellationToken,
    dispatcher: JoinHandle<RunExit>,
    server: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        self.controller.snapshot()
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Cancel and wait for in-flight handlers to finish.
    pub async fn shutdown(self) -> RunExit {
        tracing::info!("consumer_shutdown_requested");
        self.cancel.cancel();
        self.join().await
    }

    /// Wait until the dispatch loop stops (cancellation or halt), then
    /// drain in-flight handlers.
    pub async fn join(self) -> RunExit {
        let exit = match self.dispatcher.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!("dispatcher_task_failed: {}", e);
                RunExit::Disposed
            }
        };

        self.intake.cancel();
        if let Err(e) = self.server.await {
            tracing::error!("pipeline_task_failed: {}", e);
        }

        let tracker = self.pipeline.tracker();
        tracker.close();
        tracker.wait().await;
        self.controller.close();

        tracing::info!(?exit, "consumer_stopped");
        exit
    }
}
