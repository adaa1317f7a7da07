//! In-memory runtime used by the engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::{ContainerRuntime, RuntimeError, RuntimeEvent};
use crate::types::ContainerDescriptor;

pub type EventSender = mpsc::UnboundedSender<Result<RuntimeEvent, RuntimeError>>;

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerDescriptor>>,
    fail_ping: AtomicBool,
    fail_list: AtomicBool,
    list_delay: Mutex<Option<Duration>>,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    subscribe_calls: AtomicUsize,
    subscriptions: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<RuntimeEvent, RuntimeError>>>>,
}

impl FakeRuntime {
    pub fn new(containers: Vec<ContainerDescriptor>) -> Self {
        Self {
            containers: Mutex::new(containers),
            ..Default::default()
        }
    }

    pub fn set_containers(&self, containers: Vec<ContainerDescriptor>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Highest number of listings observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Queues the stream handed out by the next `events()` call. Without a
    /// queued stream, subscriptions stay silent forever.
    pub fn push_subscription(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push_back(rx);
        tx
    }
}

pub fn lifecycle(action: &str, id: &str) -> Result<RuntimeEvent, RuntimeError> {
    Ok(RuntimeEvent {
        action: action.to_string(),
        container_id: id.to_string(),
    })
}

/// An error as the daemon would report it.
pub fn server_error(message: &str) -> RuntimeError {
    RuntimeError::Docker(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.to_string(),
    })
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<String, RuntimeError> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(server_error("ping refused"));
        }
        Ok("1.45".into())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.fail_list.load(Ordering::SeqCst) {
            Err(server_error("list refused"))
        } else {
            Ok(self.containers.lock().unwrap().clone())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        match self.subscriptions.lock().unwrap().pop_front() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        }
    }
}
