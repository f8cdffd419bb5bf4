//! End-to-end signaling fan-out benchmark for Tandem.
//!
//! Every client subscribes to one topic on the same origin and publishes as
//! fast as it can. The report compares publishes sent with relayed frames
//! received, and checks the `clients` count the relay stamps on each frame
//! against the number of peers that joined.
//!
//! Usage: `e2e_throughput [clients] [url]`

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_protocol::{MessageKind, SignalingMessage};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/";
const TOPIC: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

/// Counters shared by every client task.
#[derive(Default)]
struct Counters {
    published: AtomicU64,
    relayed: AtomicU64,
    // Relayed frames whose `clients` field disagreed with the joined count.
    miscounted: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.published.store(0, Ordering::SeqCst);
        self.relayed.store(0, Ordering::SeqCst);
        self.miscounted.store(0, Ordering::SeqCst);
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Tandem signaling fan-out: {} clients on {} topic {:?}", num_clients, url, TOPIC);
    println!("Warmup {}s, measurement {}s", WARMUP_SECS, BENCH_SECS);

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let counters = Arc::clone(&counters);
            let barrier = Arc::clone(&barrier);
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = run_client(&url, client_id, num_clients, counters, barrier).await {
                    eprintln!("client {} error: {}", client_id, e);
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {} clients subscribed", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    counters.reset();
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();

    let published = counters.published.load(Ordering::SeqCst);
    let relayed = counters.relayed.load(Ordering::SeqCst);
    let miscounted = counters.miscounted.load(Ordering::SeqCst);

    // Each publish should reach every subscriber except its sender.
    let expected_fanout = num_clients.saturating_sub(1) as f64;
    let fanout = if published == 0 {
        0.0
    } else {
        relayed as f64 / published as f64
    };

    println!();
    println!("publishes sent      {:>12}  ({:.0}/s)", published, published as f64 / elapsed);
    println!("frames relayed      {:>12}  ({:.0}/s)", relayed, relayed as f64 / elapsed);
    println!("fan-out per publish {:>12.2}  (expected {:.0})", fanout, expected_fanout);
    println!("`clients` mismatch  {:>12}", miscounted);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    client_id: usize,
    num_clients: usize,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // Subscribe, then ping: the pong means the subscription is in place
    sender
        .send(Message::Text(SignalingMessage::subscribe([TOPIC]).to_text()?))
        .await?;
    sender
        .send(Message::Text(SignalingMessage::Ping.to_text()?))
        .await?;

    while let Some(result) = receiver.next().await {
        if let Message::Text(text) = result? {
            if matches!(SignalingMessage::parse(&text).map(|m| m.kind()), Ok(MessageKind::Pong)) {
                break;
            }
        }
    }

    barrier.wait().await;

    let mut payload = Map::new();
    payload.insert("sdp".into(), json!(format!("offer from client {}", client_id)));
    let publish = Message::Text(SignalingMessage::publish(TOPIC, payload).to_text()?);

    let recv_counters = Arc::clone(&counters);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else { continue };
            let Ok(SignalingMessage::Publish { payload, .. }) = SignalingMessage::parse(&text)
            else {
                continue;
            };
            recv_counters.relayed.fetch_add(1, Ordering::Relaxed);
            let clients = payload.get("clients").and_then(|c| c.as_u64());
            if clients != Some(num_clients as u64) {
                recv_counters.miscounted.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    while sender.send(publish.clone()).await.is_ok() {
        counters.published.fetch_add(1, Ordering::Relaxed);
        // Give the receiver task room to drain
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
