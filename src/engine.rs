//! Keeps the published candidate set in step with the container runtime.
//!
//! [`SyncEngine::start`] builds the first candidate set synchronously so
//! the proxy never serves an empty set just because startup was fast,
//! then spawns the watch loop:
//!
//! * subscribe to container lifecycle events and schedule a catch-up
//!   rebuild one debounce window later. The stream is polled, and so
//!   actually opened, while that rebuild is pending, which covers events
//!   missed before the subscription (or during a disconnect);
//! * push the debounce deadline forward on every event, but never past
//!   `max_debounce` after the first event of a burst, and rebuild once it
//!   elapses;
//! * on a broken or finished stream, wait `retry_interval` and subscribe
//!   again;
//! * stop as soon as the shutdown signal is raised.
//!
//! Rebuilds never patch the previous set. They list the containers,
//! build a new set outside of any lock and swap it in. A failed listing
//! leaves the last published set in place.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::candidates::CandidateSetBuilder;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::CandidateSet;
use crate::upstreams::Upstreams;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Quiet period after the last event before rebuilding.
    pub debounce: Duration,
    /// Longest a continuous stream of events can hold back a rebuild.
    pub max_debounce: Duration,
    /// Wait between a broken event stream and the next subscription.
    pub retry_interval: Duration,
    pub cache_addresses: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            cache_addresses: false,
        }
    }
}

/// Startup failures. Once running, the engine never fails.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unable to reach the container runtime: {0}")]
    Connect(#[source] RuntimeError),
    #[error("unable to list containers: {0}")]
    Enumerate(#[source] RuntimeError),
}

enum WatchExit {
    Cancelled,
    StreamError(RuntimeError),
    StreamEnded,
}

pub struct SyncEngine<R> {
    runtime: R,
    settings: SyncSettings,
    // Held for the whole of a rebuild: only one runs at a time.
    builder: Mutex<CandidateSetBuilder>,
    candidates: Arc<ArcSwap<CandidateSet>>,
}

impl<R: ContainerRuntime + 'static> SyncEngine<R> {
    /// Connects, publishes the initial candidate set and spawns the watch
    /// loop. The loop runs until `shutdown` turns `true` or its sender is
    /// dropped.
    pub async fn start(
        runtime: R,
        settings: SyncSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), SyncError> {
        let api_version = runtime.ping().await.map_err(SyncError::Connect)?;
        info!("Container runtime is connected (api version {})", api_version);

        let containers = runtime
            .list_containers()
            .await
            .map_err(SyncError::Enumerate)?;
        let mut builder = CandidateSetBuilder::new(settings.cache_addresses);
        let initial = CandidateSet {
            generation: 0,
            candidates: builder.build(&containers),
        };
        info!(
            "Initial scan found {} containers, {} upstreams",
            containers.len(),
            initial.len()
        );
        log_candidates(&initial);

        let engine = Arc::new(Self {
            runtime,
            settings,
            builder: Mutex::new(builder),
            candidates: Arc::new(ArcSwap::from_pointee(initial)),
        });
        let handle = tokio::spawn(Arc::clone(&engine).run(shutdown));
        Ok((engine, handle))
    }

    /// A read handle on the published candidate set.
    pub fn upstreams(&self) -> Upstreams {
        Upstreams::new(Arc::clone(&self.candidates))
    }

    /// Lists containers and publishes a fresh candidate set, returning its
    /// generation. Waits for any rebuild already in flight.
    pub async fn resync(&self) -> Result<u64, RuntimeError> {
        let mut builder = self.builder.lock().await;

        let containers = self.runtime.list_containers().await?;
        let candidates = builder.build(&containers);
        let generation = self.candidates.load().generation + 1;
        let published = Arc::new(CandidateSet {
            generation,
            candidates,
        });

        self.candidates.store(Arc::clone(&published));
        info!(
            "Published candidate set {} with {} upstreams",
            generation,
            published.len()
        );
        log_candidates(&published);
        Ok(generation)
    }

    async fn rebuild(&self) {
        if let Err(e) = self.resync().await {
            error!(
                "Unable to get the list of containers: {}. Keeping candidate set {}",
                e,
                self.candidates.load().generation
            );
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.watch_events(&mut shutdown).await {
                WatchExit::Cancelled => break,
                WatchExit::StreamError(e) => warn!(
                    "Unable to monitor container events: {}; will retry in {:?}",
                    e, self.settings.retry_interval
                ),
                WatchExit::StreamEnded => warn!(
                    "Container event stream ended; will retry in {:?}",
                    self.settings.retry_interval
                ),
            }

            tokio::select! {
                _ = cancelled(&mut shutdown) => break,
                _ = sleep(self.settings.retry_interval) => {}
            }
        }

        info!("Container event watcher stopped");
    }

    /// Runs one subscription until it breaks or shutdown is requested. The
    /// event stream is dropped on return.
    async fn watch_events(&self, shutdown: &mut watch::Receiver<bool>) -> WatchExit {
        if *shutdown.borrow() {
            return WatchExit::Cancelled;
        }

        let mut events = self.runtime.events();
        info!("Listening for container events...");

        // Catch-up rebuild, fired after the stream has been polled.
        let mut debounce = Debounce::default();
        debounce.trigger(Instant::now(), &self.settings);

        loop {
            tokio::select! {
                _ = cancelled(shutdown) => return WatchExit::Cancelled,
                _ = debounce_elapsed(debounce.deadline) => {
                    debounce = Debounce::default();
                    tokio::select! {
                        _ = cancelled(shutdown) => return WatchExit::Cancelled,
                        _ = self.rebuild() => {}
                    }
                }
                msg = events.next() => match msg {
                    Some(Ok(event)) => {
                        debug!("Container event: {} for {}", event.action, event.container_id);
                        debounce.trigger(Instant::now(), &self.settings);
                    }
                    Some(Err(e)) => return WatchExit::StreamError(e),
                    None => return WatchExit::StreamEnded,
                },
            }
        }
    }
}

fn log_candidates(set: &CandidateSet) {
    for c in &set.candidates {
        debug!(
            "Candidate set {}: container {} -> {} ({} matchers)",
            set.generation,
            c.container_id,
            c.upstream.dial,
            c.matchers.len()
        );
    }
}

/// Trailing debounce with an upper bound measured from the first event of
/// a burst.
#[derive(Debug, Default)]
struct Debounce {
    burst_started: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debounce {
    fn trigger(&mut self, now: Instant, settings: &SyncSettings) {
        let started = *self.burst_started.get_or_insert(now);
        let deadline = (now + settings.debounce).min(started + settings.max_debounce);
        self.deadline = Some(deadline);
    }
}

/// Resolves once shutdown is requested or the signal's sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{lifecycle, server_error, FakeRuntime};
    use crate::types::{ContainerDescriptor, LABEL_ENABLE, LABEL_UPSTREAM_PORT};
    use http::Request;

    fn container(id: &str, ip: &str, port: u16) -> ContainerDescriptor {
        ContainerDescriptor::new(id)
            .with_label(LABEL_ENABLE, "true")
            .with_label(LABEL_UPSTREAM_PORT, port.to_string())
            .with_network("bridge", ip)
    }

    fn host_request(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header("host", host)
            .body(())
            .unwrap()
    }

    fn dials(upstreams: &Upstreams) -> Vec<String> {
        upstreams
            .snapshot()
            .candidates
            .iter()
            .map(|c| c.upstream.dial.clone())
            .collect()
    }

    async fn start(
        runtime: FakeRuntime,
    ) -> (
        Arc<SyncEngine<FakeRuntime>>,
        JoinHandle<()>,
        watch::Sender<bool>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (engine, handle) = SyncEngine::start(runtime, SyncSettings::default(), shutdown_rx)
            .await
            .unwrap();
        (engine, handle, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_build_serves_requests() {
        let c1 = container("c1", "10.0.0.5", 8080)
            .with_label("com.caddyserver.http.matchers.host", "a.example.com");
        let c2 = container("c2", "10.0.0.6", 8080)
            .with_label(LABEL_ENABLE, "false")
            .with_label("com.caddyserver.http.matchers.host", "a.example.com");

        let (engine, _handle, _shutdown) = start(FakeRuntime::new(vec![c1, c2])).await;
        let upstreams = engine.upstreams();

        assert_eq!(upstreams.snapshot().generation, 0);
        let selected = upstreams.get_upstreams(&host_request("a.example.com"));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].dial, "10.0.0.5:8080");
        assert!(upstreams.get_upstreams(&host_request("b.example.com")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_errors_are_returned() {
        let runtime = FakeRuntime::new(vec![]);
        runtime.fail_ping(true);
        let (_tx, rx) = watch::channel(false);
        let err = SyncEngine::start(runtime, SyncSettings::default(), rx.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Connect(_)));

        let runtime = FakeRuntime::new(vec![]);
        runtime.fail_listing(true);
        let err = SyncEngine::start(runtime, SyncSettings::default(), rx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Enumerate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_burst_coalesces_into_one_rebuild() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let events = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        for i in 0..5 {
            events.send(lifecycle("start", &format!("c{}", i))).unwrap();
        }
        sleep(Duration::from_millis(300)).await;

        assert_eq!(engine.runtime.list_calls(), 2);
        assert_eq!(engine.upstreams().snapshot().generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_events_rebuild_each_time() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let events = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        for _ in 0..3 {
            events.send(lifecycle("die", "c1")).unwrap();
            sleep(Duration::from_millis(250)).await;
        }

        assert_eq!(engine.runtime.list_calls(), 4);
        assert_eq!(engine.upstreams().snapshot().generation, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rebuild_keeps_previous_set() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let events = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;
        let upstreams = engine.upstreams();

        engine.runtime.fail_listing(true);
        engine.runtime.set_containers(vec![]);
        events.send(lifecycle("stop", "c1")).unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(engine.runtime.list_calls(), 2);
        assert_eq!(upstreams.snapshot().generation, 0);
        assert_eq!(dials(&upstreams), ["10.0.0.5:8080"]);

        // The next event rebuilds normally again.
        engine.runtime.fail_listing(false);
        events.send(lifecycle("start", "c1")).unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(dials(&upstreams).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_stream_error() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let first = runtime.push_subscription();
        let second = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        first
            .send(Err(server_error("connection reset")))
            .unwrap();

        // Still backing off.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.runtime.subscribe_calls(), 1);

        // Resubscribed and resynced.
        sleep(Duration::from_millis(600)).await;
        assert_eq!(engine.runtime.subscribe_calls(), 2);
        assert_eq!(engine.runtime.list_calls(), 2);

        engine
            .runtime
            .set_containers(vec![container("c2", "10.0.0.7", 9000)]);
        second.send(lifecycle("start", "c2")).unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(engine.runtime.list_calls(), 3);
        assert_eq!(dials(&engine.upstreams()), ["10.0.0.7:9000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_schedules_catch_up_rebuild() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let _events = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        // Changed after the startup listing, with no event to announce it.
        engine
            .runtime
            .set_containers(vec![container("c2", "10.0.0.7", 9000)]);
        assert_eq!(dials(&engine.upstreams()), ["10.0.0.5:8080"]);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.runtime.list_calls(), 2);
        assert_eq!(dials(&engine.upstreams()), ["10.0.0.7:9000"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_storm_cannot_starve_rebuilds() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let events = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        // One event every 50ms for 1.5s, always inside the debounce window.
        for _ in 0..30 {
            events.send(lifecycle("health_status", "c1")).unwrap();
            sleep(Duration::from_millis(50)).await;
        }
        // Capped at max_debounce (1s) after the burst started.
        assert_eq!(engine.runtime.list_calls(), 2);

        // The tail of the storm settles with the plain debounce.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.runtime.list_calls(), 3);
    }

    #[test]
    fn test_debounce_deadline() {
        let settings = SyncSettings::default();
        let t0 = Instant::now();
        let mut debounce = Debounce::default();

        debounce.trigger(t0, &settings);
        assert_eq!(debounce.deadline, Some(t0 + settings.debounce));

        debounce.trigger(t0 + Duration::from_millis(50), &settings);
        assert_eq!(debounce.deadline, Some(t0 + Duration::from_millis(150)));

        debounce.trigger(t0 + Duration::from_millis(980), &settings);
        assert_eq!(debounce.deadline, Some(t0 + settings.max_debounce));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_triggers_reconnect() {
        let runtime = FakeRuntime::new(vec![]);
        let first = runtime.push_subscription();
        let (engine, _handle, _shutdown) = start(runtime).await;

        drop(first);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.runtime.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_subscribed() {
        let runtime = FakeRuntime::new(vec![]);
        let _events = runtime.push_subscription();
        let (_engine, handle, shutdown) = start(runtime).await;

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let runtime = FakeRuntime::new(vec![]);
        let events = runtime.push_subscription();
        let (engine, handle, shutdown) = start(runtime).await;

        events
            .send(Err(server_error("broken pipe")))
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        drop(shutdown);
        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
        assert_eq!(engine.runtime.subscribe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuilds_are_serialized() {
        let runtime = FakeRuntime::new(vec![container("c1", "10.0.0.5", 8080)]);
        let (engine, _handle, _shutdown) = start(runtime).await;
        // Let the subscription's catch-up rebuild finish first.
        sleep(Duration::from_millis(300)).await;
        let base = engine.upstreams().snapshot().generation;
        engine.runtime.set_list_delay(Duration::from_millis(200));

        let (a, b) = tokio::join!(engine.resync(), engine.resync());
        let mut generations = vec![a.unwrap(), b.unwrap()];
        generations.sort();

        assert_eq!(generations, [base + 1, base + 2]);
        assert_eq!(engine.runtime.max_in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_mixed_set() {
        let runtime = FakeRuntime::new(
            (0..10)
                .map(|i| container(&format!("c{}", i), &format!("10.0.0.{}", i), 1000))
                .collect(),
        );
        let (engine, _handle, _shutdown) = start(runtime).await;

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let upstreams = engine.upstreams();
                tokio::spawn(async move {
                    for _ in 0..2_000 {
                        let selected = upstreams.get_upstreams(&host_request("any.example.com"));
                        assert_eq!(selected.len(), 10);
                        let port = selected[0].dial.rsplit(':').next().unwrap().to_string();
                        assert!(selected.iter().all(|u| u.dial.ends_with(&format!(":{}", port))));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for generation in 1..=50u16 {
            engine.runtime.set_containers(
                (0..10)
                    .map(|i| {
                        container(&format!("c{}", i), &format!("10.0.0.{}", i), 1000 + generation)
                    })
                    .collect(),
            );
            engine.resync().await.unwrap();
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
