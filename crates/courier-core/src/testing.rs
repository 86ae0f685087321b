// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test doubles: a settable clock and an in-process `memory://` transport.
//!
//! The memory transport routes sends straight to the listener registered
//! for the destination URI. Sends can be made to fail, and destinations can
//! be made unreachable so that pings fail too.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{Clock, to_chrono};
use crate::error::{CoreError, Result};
use crate::transport::{Listener, Receiver, SendError, Sender, Transport, TransportMessage};
use crate::uri::Uri;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: std::time::Duration) {
        *lock(&self.now) += to_chrono(by);
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[derive(Default)]
struct Broker {
    listeners: HashMap<Uri, Arc<MemoryListener>>,
    sent: HashMap<Uri, Vec<TransportMessage>>,
    failures: HashMap<Uri, VecDeque<SendError>>,
    unreachable: HashSet<Uri>,
}

/// In-process transport for the `memory` scheme.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Mutex<Broker>>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let broker = lock(&self.broker);
        f.debug_struct("InMemoryTransport")
            .field("listeners", &broker.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InMemoryTransport {
    /// URI scheme served by this transport.
    pub const SCHEME: &'static str = "memory";

    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// `memory://{name}`.
    pub fn uri(name: &str) -> Uri {
        Uri::parse(&format!("{}://{}", Self::SCHEME, name))
            .unwrap_or_else(|_| Uri::local(name))
    }

    /// Fail the next `times` sends to `uri` with `error`.
    pub fn fail_sends(&self, uri: &Uri, times: usize, error: SendError) {
        lock(&self.broker)
            .failures
            .entry(uri.clone())
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// Make sends and pings to `uri` time out, or stop doing so.
    pub fn set_reachable(&self, uri: &Uri, reachable: bool) {
        let mut broker = lock(&self.broker);
        if reachable {
            broker.unreachable.remove(uri);
        } else {
            broker.unreachable.insert(uri.clone());
        }
    }

    /// Push raw messages into the listener at `uri`, as a broker would.
    pub async fn deliver(&self, uri: &Uri, messages: Vec<TransportMessage>) -> Result<()> {
        let listener = lock(&self.broker).listeners.get(uri).cloned();
        let listener = listener.ok_or_else(|| CoreError::UnknownEndpoint {
            uri: uri.to_string(),
        })?;
        listener.accept(messages).await
    }

    /// Messages successfully sent to `uri`.
    pub fn sent(&self, uri: &Uri) -> Vec<TransportMessage> {
        lock(&self.broker)
            .sent
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages held by the paused listener at `uri`.
    pub fn backlog(&self, uri: &Uri) -> usize {
        let listener = lock(&self.broker).listeners.get(uri).cloned();
        listener.map_or(0, |listener| lock(&listener.backlog).len())
    }
}

impl Transport for InMemoryTransport {
    fn scheme(&self) -> &str {
        Self::SCHEME
    }

    fn build_listener(&self, uri: &Uri) -> Result<Arc<dyn Listener>> {
        let listener = Arc::new(MemoryListener {
            address: uri.clone(),
            receiver: Mutex::new(None),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
        });
        lock(&self.broker)
            .listeners
            .insert(uri.clone(), Arc::clone(&listener));
        Ok(listener)
    }

    fn build_sender(&self, uri: &Uri) -> Result<Arc<dyn Sender>> {
        Ok(Arc::new(MemorySender {
            destination: uri.clone(),
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct MemoryListener {
    address: Uri,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    backlog: Mutex<VecDeque<TransportMessage>>,
}

impl MemoryListener {
    fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        if self.paused.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        lock(&self.receiver).clone()
    }

    async fn accept(&self, messages: Vec<TransportMessage>) -> Result<()> {
        let Some(receiver) = self.receiver() else {
            lock(&self.backlog).extend(messages);
            return Ok(());
        };
        receiver.received(messages).await
    }

    async fn drain_backlog(&self) {
        while let Some(receiver) = self.receiver() {
            let Some(message) = lock(&self.backlog).pop_front() else {
                break;
            };
            if receiver.received(vec![message.clone()]).await.is_err() {
                lock(&self.backlog).push_front(message);
                break;
            }
        }
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn address(&self) -> &Uri {
        &self.address
    }

    async fn start(&self, receiver: Arc<dyn Receiver>) -> Result<()> {
        *lock(&self.receiver) = Some(receiver);
        self.drain_backlog().await;
        Ok(())
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.drain_backlog().await;
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct MemorySender {
    destination: Uri,
    broker: Arc<Mutex<Broker>>,
}

#[async_trait]
impl Sender for MemorySender {
    fn destination(&self) -> &Uri {
        &self.destination
    }

    async fn send(&self, message: TransportMessage) -> std::result::Result<(), SendError> {
        let listener = {
            let mut broker = lock(&self.broker);
            if let Some(error) = broker
                .failures
                .get_mut(&self.destination)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            if broker.unreachable.contains(&self.destination) {
                return Err(SendError::TimedOut);
            }
            broker
                .listeners
                .get(&self.destination)
                .cloned()
                .ok_or(SendError::DestinationDoesNotExist)?
        };

        listener
            .accept(vec![message.clone()])
            .await
            .map_err(|e| SendError::ProcessingFailed(e.to_string()))?;
        lock(&self.broker)
            .sent
            .entry(self.destination.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn ping(&self) -> bool {
        !lock(&self.broker).unreachable.contains(&self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Collect(Mutex<Vec<TransportMessage>>);

    #[async_trait]
    impl Receiver for Collect {
        async fn received(&self, messages: Vec<TransportMessage>) -> Result<()> {
            lock(&self.0).extend(messages);
            Ok(())
        }
    }

    fn message(body: &str) -> TransportMessage {
        TransportMessage {
            body: body.as_bytes().to_vec(),
            ..TransportMessage::default()
        }
    }

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_paused_listener_backlogs_until_resumed() {
        let transport = InMemoryTransport::new();
        let uri = InMemoryTransport::uri("orders");
        let listener = transport.build_listener(&uri).unwrap();
        let collected = Arc::new(Collect(Mutex::new(Vec::new())));
        listener.start(collected.clone()).await.unwrap();

        listener.pause().await;
        transport.deliver(&uri, vec![message("a"), message("b")]).await.unwrap();
        assert_eq!(transport.backlog(&uri), 2);
        assert!(lock(&collected.0).is_empty());

        listener.resume().await;
        assert_eq!(transport.backlog(&uri), 0);
        assert_eq!(lock(&collected.0).len(), 2);
    }

    #[tokio::test]
    async fn test_sender_failures_and_reachability() {
        let transport = InMemoryTransport::new();
        let uri = InMemoryTransport::uri("billing");
        let sender = transport.build_sender(&uri).unwrap();

        assert_eq!(
            sender.send(message("x")).await,
            Err(SendError::DestinationDoesNotExist)
        );

        let listener = transport.build_listener(&uri).unwrap();
        listener
            .start(Arc::new(Collect(Mutex::new(Vec::new()))))
            .await
            .unwrap();

        transport.fail_sends(&uri, 1, SendError::ProcessingFailed("busy".into()));
        assert!(sender.send(message("x")).await.is_err());
        assert!(sender.send(message("x")).await.is_ok());

        transport.set_reachable(&uri, false);
        assert!(!sender.ping().await);
        assert_eq!(sender.send(message("y")).await, Err(SendError::TimedOut));
        transport.set_reachable(&uri, true);
        assert!(sender.ping().await);
        assert_eq!(transport.sent(&uri).len(), 1);
    }
}
