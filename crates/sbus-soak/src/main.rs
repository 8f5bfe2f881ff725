//! `sbus` soak driver
//!
//! Seeds the in-memory broker with session traffic, runs a session manager
//! against it and reports how the concurrency limits held up.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};

use sbus_client::memory::MemoryBroker;
use sbus_client::{
    ReceivedMessage, SessionClient, SessionErrorHandler, SessionHandle, SessionMessageHandler,
};
use sbus_core::{BoxError, EntityPath, Error, tracing_init};

#[derive(Parser, Debug)]
#[command(name = "sbus-soak")]
#[command(version, about = "sbus soak driver - session manager against an in-memory broker")]
struct Args {
    /// Queue name used in logs
    #[arg(long, default_value = "soak", env = "SBUS_SOAK_QUEUE")]
    queue: String,

    /// Number of distinct sessions to seed
    #[arg(long, default_value_t = 50)]
    sessions: usize,

    /// Messages seeded per session
    #[arg(long, default_value_t = 20)]
    messages_per_session: usize,

    /// Simulated handler work per message (milliseconds)
    #[arg(long, default_value_t = 5)]
    handler_delay_ms: u64,

    /// Fail every Nth message in the handler (0 disables)
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Stop after this many seconds even if messages remain
    #[arg(long, default_value_t = 120)]
    duration_secs: u64,

    /// Override `sessions.max_concurrent_sessions`
    #[arg(long)]
    max_concurrent_sessions: Option<usize>,

    /// Override `sessions.max_concurrent_accept_requests`
    #[arg(long)]
    max_concurrent_accept_requests: Option<usize>,

    /// How long the broker waits for a claimable session on each accept (seconds)
    #[arg(long, default_value_t = 1)]
    accept_timeout_secs: u64,

    /// Project directory whose `.sbus/settings.json` is loaded
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SBUS_LOG_JSON")]
    log_json: bool,
}

/// Counts handled messages and fails every Nth one.
struct SoakHandler {
    delay: Duration,
    fail_every: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl SessionMessageHandler for SoakHandler {
    async fn handle(
        &self,
        _session: &SessionHandle,
        message: &ReceivedMessage,
    ) -> Result<(), BoxError> {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.delay).await;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(format!("injected failure on message {}", message.message_id).into());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = sbus_core::config::load_config(args.project_dir.as_deref())?;
    if let Some(n) = args.max_concurrent_sessions {
        config.sessions.max_concurrent_sessions = n;
        config.sessions.max_concurrent_accept_requests = None;
    }
    if let Some(n) = args.max_concurrent_accept_requests {
        config.sessions.max_concurrent_accept_requests = Some(n);
    }
    config.log.json |= args.log_json;
    tracing_init::init_tracing(&config.log)?;

    let total = args.sessions * args.messages_per_session;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %args.queue,
        sessions = args.sessions,
        messages = total,
        max_concurrent_sessions = config.sessions.max_concurrent_sessions,
        "Starting sbus-soak"
    );

    let broker =
        MemoryBroker::new().with_accept_timeout(Duration::from_secs(args.accept_timeout_secs));
    for session in 0..args.sessions {
        for seq in 0..args.messages_per_session {
            broker.send(&format!("session-{session}"), format!("{session}:{seq}"));
        }
    }

    let client = SessionClient::with_config(
        EntityPath::queue(args.queue.clone()),
        Arc::new(broker.clone()),
        config.sessions.clone(),
    )?;
    let handler = Arc::new(SoakHandler {
        delay: Duration::from_millis(args.handler_delay_ms),
        fail_every: args.fail_every,
        seen: AtomicUsize::new(0),
    });
    let errors = Arc::new(AtomicUsize::new(0));
    let on_error: Arc<dyn SessionErrorHandler> = {
        let errors = Arc::clone(&errors);
        Arc::new(move |e: &Error| {
            errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Session error");
        })
    };
    client.receive_messages_from_sessions(
        Arc::clone(&handler) as Arc<dyn SessionMessageHandler>,
        on_error,
        client.default_options(),
    )?;

    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            () = &mut deadline => {
                warn!("Soak duration elapsed before all messages were completed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = progress.tick() => {
                let completed = broker.completed().len();
                let stats = client.manager().stats().await;
                info!(
                    completed,
                    remaining = total.saturating_sub(completed),
                    active_sessions = stats.active_sessions,
                    available_session_permits = stats.available_session_permits,
                    "Soak progress"
                );
                if completed >= total {
                    break;
                }
            }
        }
    }

    client.close().await;

    let completed = broker.completed().len();
    let peak_open = broker.peak_open_sessions();
    let limit = client.manager().max_concurrent_sessions();
    info!(
        completed,
        handled = handler.seen.load(Ordering::Relaxed),
        errors = errors.load(Ordering::Relaxed),
        accept_calls = broker.accept_calls(),
        peak_open_sessions = peak_open,
        peak_accepts_in_flight = broker.peak_accepts_in_flight(),
        "Soak finished"
    );
    if peak_open > limit {
        error!(peak_open, limit, "Open sessions exceeded the configured limit");
        anyhow::bail!("session limit violated: {peak_open} open sessions, limit {limit}");
    }
    Ok(())
}
