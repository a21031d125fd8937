use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, sleep};

use peeklock_core::app::LeaseWatch;
use peeklock_core::domain::{ConsumerError, MessageHandle, Result};
use peeklock_core::observability::init_tracing;
use peeklock_core::{ConsumerBuilder, ConsumerConfig, InMemoryMessageSource, MessageHandler};

/// Run the admission-controlled consumer against an in-memory queue.
#[derive(Debug, Parser)]
#[command(name = "peeklock", version)]
struct Args {
    /// JSON config file (ConsumerConfig). Flags below override it.
    #[arg(long, env = "PEEKLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of messages in flight.
    #[arg(long, env = "PEEKLOCK_CAPACITY")]
    capacity: Option<usize>,

    /// Number of demo messages to enqueue.
    #[arg(long, env = "PEEKLOCK_MESSAGES", default_value_t = 10)]
    messages: usize,

    /// Simulated work per message, in milliseconds.
    #[arg(long, env = "PEEKLOCK_WORK_MS", default_value_t = 1500)]
    work_ms: u64,

    /// Lock duration of the in-memory queue, in seconds.
    #[arg(long, env = "PEEKLOCK_LOCK_SECS", default_value_t = 30)]
    lock_secs: u64,

    /// Fail every n-th message (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Halt after the first handler failure.
    #[arg(long)]
    stop_on_failure: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    seq: usize,
    name: String,
}

/// handler：payload を decode して「仕事」をする
struct GreetingHandler {
    work: Duration,
    fail_every: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl MessageHandler for GreetingHandler {
    async fn handle(&self, message: &MessageHandle, lease: &LeaseWatch) -> Result<()> {
        let greeting: Greeting = message.decode()?;
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;

        // lock を失ったら途中で諦める（complete はされない）
        tokio::select! {
            lost = lease.lost() => return Err(lost),
            _ = sleep(self.work) => {}
        }

        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(ConsumerError::handler(format!(
                "intentional failure (seq={})",
                greeting.seq
            )));
        }

        println!(
            "Hello, {}! seq={} delivery={}",
            greeting.name,
            greeting.seq,
            message.delivery_count()
        );
        Ok(())
    }
}

fn load_config(args: &Args) -> std::result::Result<ConsumerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ConsumerConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => ConsumerConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if args.stop_on_failure {
        config.stop_on_failure = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.observability);

    // (A) キューを用意してメッセージを投入
    let source = Arc::new(
        InMemoryMessageSource::new(Duration::from_secs(args.lock_secs))
            .with_receive_wait(Duration::from_secs(1)),
    );
    for seq in 0..args.messages {
        source
            .send_json(&Greeting {
                seq,
                name: "peeklock".to_string(),
            })
            .await?;
    }
    tracing::info!(messages = args.messages, "demo_messages_enqueued");

    // (B) consumer を組み立てて起動
    let consumer = ConsumerBuilder::new(source.clone())
        .handler(GreetingHandler {
            work: Duration::from_millis(args.work_ms),
            fail_every: args.fail_every,
            seen: AtomicUsize::new(0),
        })
        .config(config)
        .build()?;
    let handle = consumer.start();
    let cancel = handle.cancel_token().clone();

    // (C) 全件完了 / halt / Ctrl-C のどれかまで待つ
    let watcher = {
        let source = source.clone();
        let total = args.messages;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::signal::ctrl_c() => {
                        println!("interrupted");
                        break;
                    }
                    _ = sleep(Duration::from_millis(200)) => {
                        if source.counts().await.completed >= total {
                            break;
                        }
                    }
                }
            }
            cancel.cancel();
        })
    };

    let exit = handle.join().await;
    watcher.abort();

    tracing::info!(?exit, "demo_finished");
    println!("counts: {:?}", source.counts().await);
    source.close();
    Ok(())
}
