//! ReceivePipeline - pull request を受けてメッセージを処理する
//!
//! # フロー（メッセージ一件ごと）
//! 1. `MessageSource::fetch()` で空き slot 数だけ取得
//! 2. LeaseGuard で lock を延長しながら handler 実行
//! 3. guard を止めてから `complete()`（lease を失っていたら complete しない）
//! 4. slot を返す（どの経路でも必ず一回）

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::admission::{AdmissionController, PullRequest, SlotPermit, WorkRequests};
use super::lease_guard::{LeaseGuard, LeaseOptions, LeaseWatch};
use crate::config::ConsumerConfig;
use crate::domain::{ConsumerError, MessageHandle, Result};
use crate::ports::{ErrorOrigin, ErrorSink, MessageHandler, MessageSource};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    Completed,
    /// Handler returned an error; the message is left for redelivery.
    HandlerFailed,
    /// The lock was lost while the handler ran; completion was skipped.
    LeaseLost,
    /// Handler succeeded but the source refused the completion.
    CompleteFailed,
}

#[derive(Debug, Clone)]
struct Settings {
    auto_renew: bool,
    renew_interval: Duration,
    idle_backoff: Duration,
}

/// Turns pull requests into running handlers.
#[derive(Clone)]
pub struct ReceivePipeline {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    controller: Arc<AdmissionController>,
    errors: Arc<dyn ErrorSink>,
    settings: Settings,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ReceivePipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn MessageHandler>,
        controller: Arc<AdmissionController>,
        errors: Arc<dyn ErrorSink>,
        config: &ConsumerConfig,
    ) -> Self {
        let cancel = controller.cancel_token().clone();
        Self {
            source,
            handler,
            controller,
            errors,
            settings: Settings {
                auto_renew: config.auto_renew,
                renew_interval: config.renew_interval,
                idle_backoff: config.idle_backoff,
            },
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Tracks every pull and handler task spawned by this pipeline.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Drain pull requests until `intake` fires or the controller goes away.
    ///
    /// Requests still queued when this returns are dropped, which hands
    /// their slots back.
    pub async fn serve(&self, mut requests: WorkRequests, intake: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                _ = intake.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let pipeline = self.clone();
            self.tracker.spawn(async move { pipeline.pull(request).await });
        }
        tracing::info!("pipeline_stopped");
    }

    /// Fetch up to the requested number of messages and start one handler
    /// per message. Returns how many handlers were started.
    pub async fn pull(&self, mut request: PullRequest) -> usize {
        let wanted = request.available_slots();
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return 0,
            fetched = self.source.fetch(wanted) => fetched,
        };

        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                if e.is_benign_shutdown() {
                    tracing::debug!("fetch_after_shutdown: {}", e);
                } else {
                    self.errors.report(&e, ErrorOrigin::Fetch);
                }
                Vec::new()
            }
        };

        if messages.is_empty() {
            // Hold the slot a little so an idle queue is not polled in a tight loop.
            tokio::select! {
                _ = self.cancel.cancelled() => {},
                _ = tokio::time::sleep(self.settings.idle_backoff) => {},
            }
            return 0;
        }

        let mut started = 0;
        for message in messages {
            let Some(slot) = request.take_slot() else {
                tracing::warn!(
                    message_id = %message.id(),
                    wanted,
                    "fetch_overflow: message left locked for redelivery"
                );
                continue;
            };
            let pipeline = self.clone();
            self.tracker
                .spawn(async move { pipeline.process(message, slot).await });
            started += 1;
        }
        started
    }

    /// Run one message through lease guard, handler and completion, then
    /// give its slot back.
    ///
    /// The guard keeps renewing until the handler returns, even after the
    /// consumer is cancelled, so a draining handler can still complete.
    pub async fn process(&self, message: MessageHandle, slot: SlotPermit) -> ProcessOutcome {
        let message_id = message.id();
        let guard = LeaseGuard::with_options(
            Arc::clone(&self.source),
            LeaseOptions {
                auto_renew: self.settings.auto_renew,
                renew_interval: self.settings.renew_interval,
                ..LeaseOptions::default()
            },
        );
        let lease = guard.watch();
        if let Err(e) = guard.set_message(message.clone()) {
            tracing::error!(%message_id, "lease_setup_failed: {}", e);
        }

        tracing::debug!(
            %message_id,
            delivery_count = message.delivery_count(),
            "message_received"
        );
        let handled = self.run_handler(&message, &lease).await;

        guard.stop();
        let lost = guard.state().is_lost().then(|| {
            guard
                .failure()
                .unwrap_or_else(|| ConsumerError::lease_expired("lease lost"))
        });
        guard.dispose();

        let outcome = match (handled, lost) {
            (_, Some(lost)) => {
                tracing::warn!(%message_id, "message_abandoned: {}", lost);
                ProcessOutcome::LeaseLost
            }
            (Ok(()), None) => match self.source.complete(&message).await {
                Ok(()) => {
                    tracing::debug!(%message_id, "message_completed");
                    ProcessOutcome::Completed
                }
                Err(e) => {
                    self.errors.report(&e, ErrorOrigin::Complete);
                    ProcessOutcome::CompleteFailed
                }
            },
            (Err(e), None) => {
                tracing::warn!(%message_id, "handler_failed: {}", e);
                self.controller.report_failure(&e);
                ProcessOutcome::HandlerFailed
            }
        };

        self.controller.release(slot);
        outcome
    }

    /// Handler runs in its own task; a panic counts as a handler failure.
    async fn run_handler(&self, message: &MessageHandle, lease: &LeaseWatch) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let message = message.clone();
        let lease = lease.clone();
        match tokio::spawn(async move { handler.handle(&message, &lease).await }).await {
            Ok(handled) => handled,
            Err(e) if e.is_panic() => Err(ConsumerError::handler("handler panicked")),
            Err(e) => Err(ConsumerError::handler(format!("handler task failed: {e}"))),
        }
    }
}

impl std::fmt::Debug for ReceivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePipeline")
            .field("controller", &self.controller)
            .field("settings", &self.settings)
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease_guard::LeaseWatch;
    use crate::domain::{ConsumerError, Result};
    use crate::test_support::{ScriptedSource, sample_message};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct SleepHandler {
        duration: Duration,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for SleepHandler {
        async fn handle(&self, _message: &MessageHandle, _lease: &LeaseWatch) -> Result<()> {
            tokio::time::sleep(self.duration).await;
            if self.fail {
                return Err(ConsumerError::handler("intentional failure"));
            }
            Ok(())
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl MessageHandler for PanicHandler {
        async fn handle(&self, _message: &MessageHandle, _lease: &LeaseWatch) -> Result<()> {
            panic!("handler bug");
        }
    }

    type Reported = Arc<Mutex<Vec<(ConsumerError, ErrorOrigin)>>>;

    fn pipeline(
        source: &Arc<ScriptedSource>,
        handler: impl MessageHandler + 'static,
        stop_on_failure: bool,
    ) -> (ReceivePipeline, Arc<AdmissionController>, WorkRequests, Reported) {
        let config = ConsumerConfig {
            capacity: 2,
            stop_on_failure,
            ..ConsumerConfig::default()
        };
        let (controller, requests) =
            AdmissionController::new(config.capacity, CancellationToken::new(), stop_on_failure)
                .unwrap();
        let controller = Arc::new(controller);
        let reported: Reported = Arc::default();
        let sink = {
            let reported = Arc::clone(&reported);
            move |e: &ConsumerError, origin: ErrorOrigin| {
                reported.lock().unwrap().push((e.clone(), origin));
            }
        };
        let pipeline = ReceivePipeline::new(
            Arc::clone(source) as Arc<dyn MessageSource>,
            Arc::new(handler),
            Arc::clone(&controller),
            Arc::new(sink),
            &config,
        );
        (pipeline, controller, requests, reported)
    }

    fn quick() -> SleepHandler {
        SleepHandler {
            duration: Duration::from_millis(10),
            fail: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_handler_completes_and_releases() {
        let source = Arc::new(ScriptedSource::new());
        let (pipeline, controller, _requests, _reported) = pipeline(&source, quick(), false);
        let message = sample_message();
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(message.clone(), slot).await;

        assert_eq!(outcome, ProcessOutcome::Completed);
        assert_eq!(source.completed(), vec![message.id()]);
        assert_eq!(controller.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_handler_keeps_renewing() {
        let source = Arc::new(ScriptedSource::new());
        let handler = SleepHandler {
            duration: Duration::from_secs(30),
            fail: false,
        };
        let (pipeline, controller, _requests, _reported) = pipeline(&source, handler, false);
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(sample_message(), slot).await;

        assert_eq!(outcome, ProcessOutcome::Completed);
        // renewals at 8s, 16s and 24s
        assert_eq!(source.renewals(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_skips_completion() {
        let source = Arc::new(ScriptedSource::new());
        source.fail_renewals(ConsumerError::lease_expired("gone"));
        let handler = SleepHandler {
            duration: Duration::from_secs(20),
            fail: false,
        };
        let (pipeline, controller, _requests, _reported) = pipeline(&source, handler, false);
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(sample_message(), slot).await;

        assert_eq!(outcome, ProcessOutcome::LeaseLost);
        assert!(source.completed().is_empty());
        assert_eq!(source.renewals(), 1);
        assert_eq!(controller.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_releases_and_halts_when_configured() {
        let source = Arc::new(ScriptedSource::new());
        let handler = SleepHandler {
            duration: Duration::from_millis(10),
            fail: true,
        };
        let (pipeline, controller, _requests, _reported) = pipeline(&source, handler, true);
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(sample_message(), slot).await;

        assert_eq!(outcome, ProcessOutcome::HandlerFailed);
        assert!(source.completed().is_empty());
        assert!(controller.is_halted());
        assert_eq!(controller.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_counts_as_failure() {
        let source = Arc::new(ScriptedSource::new());
        let (pipeline, controller, _requests, _reported) = pipeline(&source, PanicHandler, true);
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(sample_message(), slot).await;

        assert_eq!(outcome, ProcessOutcome::HandlerFailed);
        assert!(source.completed().is_empty());
        assert!(controller.is_halted());
        assert_eq!(controller.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_outlives_consumer_cancellation() {
        let source = Arc::new(ScriptedSource::new());
        let handler = SleepHandler {
            duration: Duration::from_secs(30),
            fail: false,
        };
        let (pipeline, controller, _requests, _reported) = pipeline(&source, handler, false);
        let slot = controller.acquire().await.unwrap();
        let message = sample_message();

        let cancel = controller.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let outcome = pipeline.process(message.clone(), slot).await;

        assert_eq!(outcome, ProcessOutcome::Completed);
        assert_eq!(source.completed(), vec![message.id()]);
        // renewals at 8s, 16s and 24s despite the cancel at 1s
        assert_eq!(source.renewals(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_failure_is_reported_not_swallowed() {
        let source = Arc::new(ScriptedSource::new());
        source.fail_completes(ConsumerError::resource_disposed("receiver closed"));
        let (pipeline, controller, _requests, reported) = pipeline(&source, quick(), false);
        let slot = controller.acquire().await.unwrap();

        let outcome = pipeline.process(sample_message(), slot).await;

        assert_eq!(outcome, ProcessOutcome::CompleteFailed);
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(matches!(reported[0].0, ConsumerError::ResourceDisposed(_)));
        assert_eq!(reported[0].1, ErrorOrigin::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_is_reported_and_slot_returned() {
        let source = Arc::new(ScriptedSource::new());
        source.fail_next_fetch(ConsumerError::transport("connection reset"));
        let (pipeline, controller, mut requests, reported) = pipeline(&source, quick(), false);

        let runner = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run().await }
        });
        let request = requests.recv().await.unwrap();

        assert_eq!(pipeline.pull(request).await, 0);
        assert_eq!(reported.lock().unwrap()[0].1, ErrorOrigin::Fetch);
        assert_eq!(source.fetches(), 1);

        controller.cancel_token().cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn serve_processes_everything_within_capacity() {
        let messages: Vec<_> = (0..5).map(|_| sample_message()).collect();
        let source = Arc::new(ScriptedSource::new().with_messages(messages.clone()));
        let (pipeline, controller, requests, reported) = pipeline(&source, quick(), false);
        let intake = CancellationToken::new();

        let runner = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run().await }
        });
        let server = tokio::spawn({
            let pipeline = pipeline.clone();
            let intake = intake.clone();
            async move { pipeline.serve(requests, intake).await }
        });

        while source.completed().len() < messages.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        controller.cancel_token().cancel();
        intake.cancel();
        runner.await.unwrap();
        server.await.unwrap();
        pipeline.tracker().close();
        pipeline.tracker().wait().await;

        let mut completed = source.completed();
        completed.sort();
        let mut expected: Vec<_> = messages.iter().map(|m| m.id()).collect();
        expected.sort();
        assert_eq!(completed, expected);
        assert!(reported.lock().unwrap().is_empty());
        assert_eq!(controller.available(), 2);
    }
}
