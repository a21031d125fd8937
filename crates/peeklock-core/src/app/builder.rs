//! ConsumerBuilder - consumer の構築とワイヤリング
//!
//! MessageSource と AdmissionController はここで一度だけ作り、
//! 参照を明示的に渡します（グローバルな singleton は使わない）。
//!
//! # Fail-fast 設計
//! - handler 未登録なら `BuildError::MissingHandler`
//! - 設定値が不正なら `BuildError::InvalidConfig`

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::admission::AdmissionController;
use super::consumer::Consumer;
use super::pipeline::ReceivePipeline;
use crate::config::ConsumerConfig;
use crate::domain::ConsumerError;
use crate::ports::{ErrorSink, MessageHandler, MessageSource, TracingErrorSink};

/// # 使用例
/// ```ignore
/// let consumer = ConsumerBuilder::new(source)
///     .handler(MyHandler)
///     .config(config)
///     .build()?;
/// let handle = consumer.start();
/// ```
pub struct ConsumerBuilder {
    source: Arc<dyn MessageSource>,
    handler: Option<Arc<dyn MessageHandler>>,
    errors: Arc<dyn ErrorSink>,
    config: ConsumerConfig,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no message handler registered")]
    MissingHandler,

    #[error(transparent)]
    InvalidConfig(#[from] ConsumerError),
}

impl ConsumerBuilder {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            handler: None,
            errors: Arc::new(TracingErrorSink),
            config: ConsumerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handler<H: MessageHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn error_sink<E: ErrorSink + 'static>(mut self, errors: E) -> Self {
        self.errors = Arc::new(errors);
        self
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.config.stop_on_failure = stop_on_failure;
        self
    }

    /// Cancellation scope shared by slot acquisition, fetches and renewal.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<Consumer, BuildError> {
        let handler = self.handler.ok_or(BuildError::MissingHandler)?;
        self.config.validate()?;

        let (controller, requests) = AdmissionController::new(
            self.config.capacity,
            self.cancel.clone(),
            self.config.stop_on_failure,
        )?;
        let controller = Arc::new(controller);
        let pipeline = ReceivePipeline::new(
            self.source,
            handler,
            Arc::clone(&controller),
            self.errors,
            &self.config,
        );

        Ok(Consumer::new(controller, pipeline, requests, self.cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease_guard::LeaseWatch;
    use crate::domain::{MessageHandle, Result};
    use crate::test_support::ScriptedSource;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _message: &MessageHandle, _lease: &LeaseWatch) -> Result<()> {
            Ok(())
        }
    }

    fn source() -> Arc<dyn MessageSource> {
        Arc::new(ScriptedSource::new())
    }

    #[test]
    fn test_build_success() {
        let consumer = ConsumerBuilder::new(source())
            .handler(NoopHandler)
            .capacity(4)
            .build()
            .unwrap();
        assert_eq!(consumer.controller().capacity(), 4);
    }

    #[test]
    fn test_build_missing_handler() {
        let result = ConsumerBuilder::new(source()).build();
        assert!(matches!(result, Err(BuildError::MissingHandler)));
    }

    #[test]
    fn test_build_zero_capacity() {
        let result = ConsumerBuilder::new(source())
            .handler(NoopHandler)
            .capacity(0)
            .build();
        assert!(matches!(
            result,
            Err(BuildError::InvalidConfig(ConsumerError::InvalidArgument(_)))
        ));
    }
}
