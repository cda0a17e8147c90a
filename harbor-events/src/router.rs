//! Event router: per-id and filtered subscriptions, and reference-counted
//! topic feeds.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use harbor_core::{EventId, EventTopic, SessionEvent, TransportError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::transport::EventTransport;

type Topics = Arc<Mutex<HashMap<EventTopic, usize>>>;

/// Handle returned by every subscription. Unsubscribing is idempotent, and
/// dropping the handle unsubscribes too.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Subscription that aborts `handle` when cancelled.
    pub fn for_task(handle: JoinHandle<()>) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Keep the subscription alive for the rest of the program.
    pub fn detach(self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Stream of inbound events passing a filter. Lagging behind the broadcast
/// buffer skips the lost events with a warning; the stream keeps going.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = SessionEvent> + Send>>,
    _leases: Vec<TopicLease>,
}

impl EventStream {
    fn new<P>(receiver: tokio::sync::broadcast::Receiver<SessionEvent>, filter: P) -> Self
    where
        P: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        let inner = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(event) if filter(&event) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged; events were dropped");
                None
            }
        });
        Self {
            inner: Box::pin(inner),
            _leases: Vec::new(),
        }
    }

    fn holding(mut self, leases: Vec<TopicLease>) -> Self {
        self._leases = leases;
        self
    }

    /// Next matching event, or `None` once the transport is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.inner.next().await
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Holds one reference to a topic subscription on the server.
struct TopicLease {
    topic: EventTopic,
    topics: Topics,
    transport: EventTransport,
}

impl TopicLease {
    // Frames are queued while the count lock is held so that the server
    // sees subscribe and unsubscribe in the order the count changed.
    fn acquire(topic: EventTopic, topics: &Topics, transport: &EventTransport) -> Self {
        {
            let mut counts = topics.lock().unwrap_or_else(PoisonError::into_inner);
            let count = counts.entry(topic).or_insert(0);
            *count += 1;
            if *count == 1 {
                debug!(topic = %topic, "Subscribing to topic");
                send_or_log(transport, SessionEvent::topic_subscribe(topic));
            }
        }
        Self {
            topic,
            topics: Arc::clone(topics),
            transport: transport.clone(),
        }
    }
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        let mut counts = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(&self.topic) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(&self.topic);
                debug!(topic = %self.topic, "Unsubscribing from topic");
                send_or_log(&self.transport, SessionEvent::topic_unsubscribe(self.topic));
            }
            None => {}
        }
    }
}

fn send_or_log(transport: &EventTransport, event: SessionEvent) {
    if let Err(err) = transport.emit(event) {
        debug!(error = %err, "Topic frame not sent");
    }
}

/// Events of one topic, mapped. Holds the topic subscription for as long
/// as it lives.
pub struct TopicStream<T> {
    events: EventStream,
    map_to: Arc<dyn Fn(SessionEvent) -> T + Send + Sync>,
    _lease: TopicLease,
}

impl<T> TopicStream<T> {
    pub async fn next_event(&mut self) -> Option<T> {
        let event = self.events.next_event().await?;
        Some((self.map_to)(event))
    }
}

impl<T> Stream for TopicStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        Pin::new(&mut this.events)
            .poll_next(cx)
            .map(|event| event.map(|event| (this.map_to)(event)))
    }
}

/// Lazy, restartable feed of one topic's events. Nothing is sent to the
/// server until the first consumer attaches.
pub struct TopicFeed<T> {
    topic: EventTopic,
    router: EventRouter,
    map_to: Arc<dyn Fn(SessionEvent) -> T + Send + Sync>,
}

impl<T> Clone for TopicFeed<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic,
            router: self.router.clone(),
            map_to: Arc::clone(&self.map_to),
        }
    }
}

impl<T: Send + 'static> TopicFeed<T> {
    pub fn topic(&self) -> EventTopic {
        self.topic
    }

    /// Attach a consumer. The first live consumer of a topic sends the
    /// subscribe frame.
    pub fn subscribe(&self) -> TopicStream<T> {
        let topic = self.topic;
        let events = self
            .router
            .subscribe_events(move |event| event.topic_id == Some(topic));
        TopicStream {
            events,
            map_to: Arc::clone(&self.map_to),
            _lease: TopicLease::acquire(topic, &self.router.topics, &self.router.transport),
        }
    }

    /// Attach a callback consumer running on its own task.
    pub fn on<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut stream = self.subscribe();
        Subscription::for_task(tokio::spawn(async move {
            while let Some(item) = stream.next_event().await {
                callback(item);
            }
        }))
    }
}

/// Demultiplexes transport events to subscribers.
#[derive(Clone)]
pub struct EventRouter {
    transport: EventTransport,
    topics: Topics,
}

impl EventRouter {
    /// Build a router over `transport`. Topics with live consumers are
    /// subscribed again after every reconnect.
    pub fn new(transport: EventTransport) -> Self {
        let topics: Topics = Arc::new(Mutex::new(HashMap::new()));
        let router = Self { transport, topics };
        router.spawn_resubscriber();
        router
    }

    pub fn transport(&self) -> &EventTransport {
        &self.transport
    }

    pub fn emit(&self, event: SessionEvent) -> Result<(), TransportError> {
        self.transport.emit(event)
    }

    /// Topics that currently have at least one consumer.
    pub fn active_topics(&self) -> Vec<EventTopic> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Call `callback` for every event with identifier `id`.
    pub fn on_event<F>(&self, id: impl Into<EventId>, callback: F) -> Subscription
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.on_event_map(id, |event| event, callback)
    }

    /// Like [`on_event`](Self::on_event), with events mapped by `map_to`.
    pub fn on_event_map<T, M, F>(&self, id: impl Into<EventId>, map_to: M, callback: F) -> Subscription
    where
        T: Send + 'static,
        M: Fn(SessionEvent) -> T + Send + Sync + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let id = id.into();
        self.on_filtered(move |event| event.id() == id, map_to, callback)
    }

    /// Call `callback` for every event.
    pub fn on<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.on_filtered(|_| true, |event| event, callback)
    }

    /// Call `callback` with `map_to(event)` for every event passing `filter`.
    /// Events reach the callback in arrival order.
    pub fn on_filtered<T, P, M, F>(&self, filter: P, map_to: M, mut callback: F) -> Subscription
    where
        T: Send + 'static,
        P: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
        M: Fn(SessionEvent) -> T + Send + Sync + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let mut receiver = self.transport.subscribe();
        Subscription::for_task(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if filter(&event) => callback(map_to(event)),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged; events were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Stream of events passing `filter`. Dropping it unsubscribes.
    pub fn subscribe_events<P>(&self, filter: P) -> EventStream
    where
        P: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        EventStream::new(self.transport.subscribe(), filter)
    }

    /// Stream of events on any of `topics` that pass `filter`. The stream
    /// holds a subscription to each topic until it is dropped.
    pub fn subscribe_topic_events<P>(&self, topics: &[EventTopic], filter: P) -> EventStream
    where
        P: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        let scoped: Vec<EventTopic> = topics.to_vec();
        let events = self.subscribe_events(move |event| {
            event.topic_id.is_some_and(|topic| scoped.contains(&topic)) && filter(event)
        });
        let leases = topics
            .iter()
            .map(|topic| TopicLease::acquire(*topic, &self.topics, &self.transport))
            .collect();
        events.holding(leases)
    }

    /// Feed of events scoped to `topic`, mapped by `map_to`.
    pub fn multiplex<T, M>(&self, topic: EventTopic, map_to: M) -> TopicFeed<T>
    where
        M: Fn(SessionEvent) -> T + Send + Sync + 'static,
    {
        TopicFeed {
            topic,
            router: self.clone(),
            map_to: Arc::new(map_to),
        }
    }

    fn spawn_resubscriber(&self) {
        let mut opened = self.transport.on_init();
        let topics = Arc::clone(&self.topics);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            loop {
                match opened.recv().await {
                    Ok(opens) if opens > 1 => {
                        let counts = topics.lock().unwrap_or_else(PoisonError::into_inner);
                        for topic in counts.keys() {
                            debug!(topic = %topic, "Resubscribing after reconnect");
                            send_or_log(&transport, SessionEvent::topic_subscribe(*topic));
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
