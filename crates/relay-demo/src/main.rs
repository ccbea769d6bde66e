//! Relays a simulated generation to a live client while a second reader
//! follows it through the delta store, then prints the merged thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures::Stream;
use relay_core::prelude::*;
use relay_core::{EventResult, GenerationError, MessageMetadata, init_observability};
use relay_view::{ReaderView, ThrottleConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-demo")]
#[command(about = "Stream a fake answer through the delta relay and resume it from a second reader")]
struct Cli {
    /// Answer text streamed word by word
    #[arg(long, default_value = "Deltas are batched at word boundaries, persisted, and replayed by any reader that joins late.")]
    text: String,

    /// Delay between generated chunks in milliseconds
    #[arg(long, default_value_t = 40)]
    chunk_ms: u64,

    /// Batcher throttle in milliseconds (overrides RELAY_THROTTLE_MS)
    #[arg(long)]
    throttle_ms: Option<u64>,

    /// Boundary regex a pending delta must match before flushing
    /// (overrides RELAY_BOUNDARY_PATTERN)
    #[arg(long)]
    boundary: Option<String>,

    /// Reader render rate limit (overrides RELAY_MAX_FPS)
    #[arg(long)]
    max_fps: Option<f64>,

    /// How often the second reader polls the delta store, in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Fail the generation after this many chunks
    #[arg(long)]
    fail_after: Option<usize>,

    /// Abort the generation after this many live events
    #[arg(long)]
    abort_after: Option<usize>,

    /// Print the final thread as JSON
    #[arg(long)]
    json: bool,
}

/// Scripted generation: one event per chunk of `text`, paced by `pause`.
fn scripted_generation(
    message_id: &str,
    text: &str,
    fail_after: Option<usize>,
    pause: Duration,
) -> impl Stream<Item = EventResult> + Send + 'static {
    let script = script(message_id, text, fail_after);
    futures::stream::unfold(script, move |mut script| async move {
        let item = script.pop_front()?;
        tokio::time::sleep(pause).await;
        Some((item, script))
    })
}

fn script(message_id: &str, text: &str, fail_after: Option<usize>) -> VecDeque<EventResult> {
    let mut items = VecDeque::new();
    items.push_back(Ok(StreamEvent::start(message_id)));
    items.push_back(Ok(StreamEvent::StartStep));
    items.push_back(Ok(StreamEvent::TextStart { id: "t0".into() }));
    for (index, word) in text.split_inclusive(' ').enumerate() {
        if fail_after == Some(index) {
            items.push_back(Err(GenerationError::provider("simulated provider outage")));
            return items;
        }
        items.push_back(Ok(StreamEvent::text_delta("t0", word)));
    }
    items.push_back(Ok(StreamEvent::TextEnd { id: "t0".into() }));
    items.push_back(Ok(StreamEvent::FinishStep));
    items.push_back(Ok(StreamEvent::finish()));
    items
}

fn batcher_config(cli: &Cli) -> Result<BatcherConfig> {
    let mut config = BatcherConfig::from_env().context("invalid batcher configuration")?;
    if let Some(ms) = cli.throttle_ms {
        config = config.throttle(Duration::from_millis(ms));
    }
    config = match &cli.boundary {
        Some(pattern) => config.boundary_pattern(pattern)?,
        None if config.boundary.is_none() => config.word_boundaries(),
        None => config,
    };
    Ok(config)
}

fn throttle_config(cli: &Cli) -> Result<ThrottleConfig> {
    let mut config = ThrottleConfig::from_env().context("invalid render throttle configuration")?;
    if let Some(fps) = cli.max_fps {
        config = config.max_fps(fps);
    }
    Ok(config)
}

fn render_line(messages: &[Message]) -> String {
    let last = messages.last().map_or_else(String::new, |m| {
        format!("{} [{:?}] {:?}", m.id, m.live_status(), m.text())
    });
    format!("render: {} message(s), last = {last}", messages.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();

    let store = Arc::new(InMemoryDeltaStore::new());
    let history = Arc::new(InMemoryHistoryStore::new());
    let thread = ThreadId::new("demo-thread");
    let question = Message::user_text("question", "How does the relay work?")
        .with_metadata(MessageMetadata::with_status(LiveStatus::Completed).created_at(Utc::now()));
    history.upsert_message(&thread, question).await?;

    let relay = StreamRelay::new(store.clone(), batcher_config(&cli)?).with_history(history.clone());
    let key = StreamKey::new(thread.clone(), "answer");
    let source = scripted_generation(
        key.message_id.as_str(),
        &cli.text,
        cli.fail_after,
        Duration::from_millis(cli.chunk_ms),
    );
    let mut live = relay.start(key.clone(), source).await?;
    info!(session_id = %live.session_id(), key = %key, "generation started");

    let view = Arc::new(ReaderView::new(&throttle_config(&cli)?));
    view.subscribe(|messages| println!("{}", render_line(messages)));
    view.load_history(history.as_ref(), &thread).await?;

    let reader = ResumeReader::new(store.clone(), history.clone());
    let poller = {
        let view = view.clone();
        let key = key.clone();
        let poll = Duration::from_millis(cli.poll_ms);
        tokio::spawn(async move {
            loop {
                match view.poll(&reader, &key).await {
                    Ok(true) => break reader,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(error = %err, "resume poll failed");
                        break reader;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        })
    };

    let abort = live.abort_handle();
    let mut seen = 0usize;
    let mut streamed = String::new();
    while let Some(item) = live.next_event().await {
        seen += 1;
        match item {
            Ok(event) => {
                if let Some(delta) = event.delta_text() {
                    streamed.push_str(delta);
                }
            }
            Err(err) => println!("live: generation failed: {err}"),
        }
        if cli.abort_after == Some(seen) {
            println!("live: aborting after {seen} event(s)");
            abort.abort();
            break;
        }
    }
    println!("live: {streamed:?}");

    let outcome = live.finish().await?;
    println!("outcome: {outcome:?}");

    let reader = poller.await.context("resume poller panicked")?;
    view.poll(&reader, &key).await?;
    view.resume();

    let thread_view = view.current();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&thread_view)?);
    } else {
        for message in &thread_view {
            println!(
                "{:>9} {:<10} {:?} {:?}",
                format!("{:?}", message.role),
                message.id,
                message.live_status(),
                message.text()
            );
        }
    }
    view.dispose();
    Ok(())
}
