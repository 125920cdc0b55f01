//! Fan-out of usbmuxd device events
//!
//! One `Listen` connection is shared by every live [`Subscription`]. The table
//! of subscribers and the listener task both sit behind one mutex; the task
//! exists exactly while the table is non-empty.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures_lite::Stream;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    ReadWrite,
    device::{DeviceEvent, DeviceEventKind, UsbMuxDevice},
    error::Result,
    parser::usbmux::{PayloadMessageType, UsbMuxPacket},
    usbmux::UsbMuxClient,
};

#[derive(Debug)]
struct Listener {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct State {
    next_token: u64,
    next_generation: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<DeviceEvent>>,
    listener: Option<Listener>,
}

#[derive(Debug)]
pub struct SubscriptionManager {
    client: UsbMuxClient,
    state: Mutex<State>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(client: UsbMuxClient) -> Arc<Self> {
        Arc::new(Self {
            client,
            state: Mutex::new(State::default()),
        })
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Whether the daemon connection is currently open
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.lock().listener.is_some()
    }

    /// Adds a subscriber, opening the daemon connection if none is open
    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
        let mut needs_listener = !self.is_listening();

        loop {
            // the lock is never held across the connect
            let stream = if needs_listener {
                Some(self.client.listen().await?)
            } else {
                None
            };

            let mut state = self.state.lock();

            match (state.listener.is_some(), stream) {
                (true, _) => {}
                (false, Some(stream)) => {
                    let generation = state.next_generation;
                    state.next_generation += 1;

                    let task = tokio::spawn(dispatch(Arc::downgrade(self), generation, stream));
                    state.listener = Some(Listener { generation, task });

                    tracing::info!("usbmux event subscription started");
                }
                (false, None) => {
                    // the last subscriber left while we were deciding
                    needs_listener = true;
                    continue;
                }
            }

            let token = state.next_token;
            state.next_token += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.insert(token, tx);

            return Ok(Subscription {
                token,
                rx,
                manager: Arc::clone(self),
            });
        }
    }

    fn unsubscribe(&self, token: u64) {
        let mut state = self.state.lock();
        state.subscribers.remove(&token);

        if state.subscribers.is_empty()
            && let Some(listener) = state.listener.take()
        {
            listener.task.abort();
            tracing::info!("usbmux event subscription stopped");
        }
    }

    fn publish(&self, event: &DeviceEvent) {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn listener_finished(&self, generation: u64) {
        let mut state = self.state.lock();

        if state
            .listener
            .as_ref()
            .is_some_and(|l| l.generation == generation)
        {
            state.listener = None;
            // dropping the senders ends every subscriber's stream
            state.subscribers.clear();
        }
    }
}

/// Tracks `DeviceID -> device` so that `Detached` events, which only carry
/// the id, can be reported with the full device
#[derive(Debug, Default)]
struct EventDecoder {
    known: HashMap<u32, UsbMuxDevice>,
}

impl EventDecoder {
    fn decode(&mut self, message: &plist::Dictionary) -> Option<DeviceEvent> {
        let message_type = message
            .get("MessageType")
            .and_then(plist::Value::as_string)
            .and_then(|t| PayloadMessageType::try_from(t).ok())?;

        let device_id = message
            .get("DeviceID")
            .and_then(plist::Value::as_unsigned_integer)
            .map(|id| id as u32);

        match message_type {
            PayloadMessageType::Attached => {
                let device = UsbMuxDevice::from_entry(message)
                    .inspect_err(|e| tracing::warn!(error = %e, "malformed attach event"))
                    .ok()?;
                self.known.insert(device.handle.0, device.clone());

                Some(DeviceEvent {
                    kind: DeviceEventKind::Added,
                    device,
                })
            }
            PayloadMessageType::Detached => {
                let device = self.known.remove(&device_id?)?;

                Some(DeviceEvent {
                    kind: DeviceEventKind::Removed,
                    device,
                })
            }
            PayloadMessageType::Paired => {
                let device = self.known.get(&device_id?)?.clone();

                Some(DeviceEvent {
                    kind: DeviceEventKind::Paired,
                    device,
                })
            }
            other => {
                tracing::debug!(message_type = %other, "ignoring non event message");
                None
            }
        }
    }
}

async fn dispatch(
    manager: Weak<SubscriptionManager>,
    generation: u64,
    mut stream: Box<dyn ReadWrite>,
) {
    let mut decoder = EventDecoder::default();

    loop {
        let message = match UsbMuxPacket::parse(&mut stream).await {
            Ok(packet) => match packet.into_dictionary() {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed usbmux event");
                    continue;
                }
            },
            Err(e) => {
                tracing::info!(error = %e, "usbmux event stream ended");
                break;
            }
        };

        let Some(event) = decoder.decode(&message) else {
            continue;
        };
        tracing::debug!(kind = ?event.kind, udid = %event.device.udid, "device event");

        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.publish(&event);
    }

    if let Some(manager) = manager.upgrade() {
        manager.listener_finished(generation);
    }
}

/// Stream of device events, unsubscribes when dropped
#[derive(Debug)]
pub struct Subscription {
    token: u64,
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
    manager: Arc<SubscriptionManager>,
}

impl Subscription {
    /// The manager this subscription belongs to
    #[must_use]
    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    /// Waits for the next event, `None` once the daemon connection is gone
    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.token);
    }
}
