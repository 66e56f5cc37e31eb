//! In-process voice transport
//!
//! Speaking events and per-speaker audio are pushed in by the caller (tests,
//! the `simulate` command) instead of arriving from a voice gateway.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{
    AUDIO_TAP_CAPACITY, ChannelRef, ConnectionHandle, EVENT_CAPACITY, RawAudioStream,
    SpeakingEvent, TransportConnection, VoiceTransport,
};
use crate::{Error, Result};

/// How `join` behaves
#[derive(Debug, Clone, Default)]
pub enum JoinBehavior {
    /// Join succeeds immediately
    #[default]
    Accept,
    /// Join fails with the given reason
    Fail(String),
    /// Join never completes
    Hang,
}

struct LoopbackChannel {
    connection_id: u64,
    events: mpsc::Sender<SpeakingEvent>,
    taps: HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
}

#[derive(Default)]
struct LoopbackState {
    behavior: JoinBehavior,
    channels: HashMap<ChannelRef, LoopbackChannel>,
    joins: usize,
}

/// Voice transport driven from inside the process
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    /// Create a transport whose joins succeed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change how subsequent joins behave
    pub fn set_join_behavior(&self, behavior: JoinBehavior) {
        if let Ok(mut state) = self.state.lock() {
            state.behavior = behavior;
        }
    }

    /// Number of join attempts so far
    #[must_use]
    pub fn join_count(&self) -> usize {
        self.state.lock().map(|s| s.joins).unwrap_or_default()
    }

    /// Whether a connection to the channel is open
    #[must_use]
    pub fn is_connected(&self, channel: &ChannelRef) -> bool {
        self.state
            .lock()
            .map(|s| s.channels.contains_key(channel))
            .unwrap_or(false)
    }

    /// Number of open taps on a speaker
    #[must_use]
    pub fn open_taps(&self, channel: &ChannelRef, speaker: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.channels
                    .get(channel)
                    .and_then(|c| c.taps.get(speaker))
                    .map(|taps| taps.iter().filter(|t| !t.is_closed()).count())
            })
            .unwrap_or(0)
    }

    /// Drop the connection from the transport side, as a gateway would on a
    /// kick or a network loss. Closes the event stream and every tap.
    ///
    /// Returns whether the channel was joined.
    pub fn drop_connection(&self, channel: &ChannelRef) -> bool {
        let dropped = self
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.channels.remove(channel))
            .is_some();
        tracing::debug!(channel = %channel, dropped, "loopback connection dropped");
        dropped
    }

    /// Announce that a speaker started talking
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not joined
    pub async fn start_speaking(&self, channel: &ChannelRef, speaker: &str) -> Result<()> {
        self.send_event(channel, SpeakingEvent::Started(speaker.to_string()))
            .await
    }

    /// Announce that a speaker stopped talking
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not joined
    pub async fn stop_speaking(&self, channel: &ChannelRef, speaker: &str) -> Result<()> {
        self.send_event(channel, SpeakingEvent::Ended(speaker.to_string()))
            .await
    }

    /// Deliver one encoded chunk to every open tap on `speaker`
    ///
    /// Returns the number of taps that received it.
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not joined
    pub async fn push_audio(
        &self,
        channel: &ChannelRef,
        speaker: &str,
        chunk: &[u8],
    ) -> Result<usize> {
        let taps: Vec<mpsc::Sender<Vec<u8>>> = {
            let state = self
                .state
                .lock()
                .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;
            let joined = state
                .channels
                .get(channel)
                .ok_or_else(|| Error::Connect(format!("channel {channel} not joined")))?;
            joined.taps.get(speaker).cloned().unwrap_or_default()
        };

        let mut delivered = 0;
        for tap in &taps {
            if tap.send(chunk.to_vec()).await.is_ok() {
                delivered += 1;
            }
        }

        if delivered < taps.len() {
            if let Ok(mut state) = self.state.lock() {
                if let Some(list) = state
                    .channels
                    .get_mut(channel)
                    .and_then(|c| c.taps.get_mut(speaker))
                {
                    list.retain(|t| !t.is_closed());
                }
            }
        }

        tracing::trace!(channel = %channel, speaker, delivered, "loopback audio pushed");
        Ok(delivered)
    }

    async fn send_event(&self, channel: &ChannelRef, event: SpeakingEvent) -> Result<()> {
        let events = {
            let state = self
                .state
                .lock()
                .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;
            state
                .channels
                .get(channel)
                .map(|c| c.events.clone())
                .ok_or_else(|| Error::Connect(format!("channel {channel} not joined")))?
        };

        events
            .send(event)
            .await
            .map_err(|_| Error::Connect(format!("channel {channel} event stream closed")))
    }
}

#[async_trait]
impl VoiceTransport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn join(&self, channel: &ChannelRef) -> Result<TransportConnection> {
        let behavior = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;
            state.joins += 1;
            state.behavior.clone()
        };

        match behavior {
            JoinBehavior::Accept => {}
            JoinBehavior::Fail(reason) => return Err(Error::Connect(reason)),
            JoinBehavior::Hang => std::future::pending::<()>().await,
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;
        state.channels.insert(
            channel.clone(),
            LoopbackChannel {
                connection_id: id,
                events: events_tx,
                taps: HashMap::new(),
            },
        );

        tracing::debug!(channel = %channel, connection = id, "loopback joined");

        Ok(TransportConnection {
            handle: ConnectionHandle {
                id,
                channel: channel.clone(),
            },
            events: events_rx,
        })
    }

    fn subscribe(&self, connection: &ConnectionHandle, speaker: &str) -> Result<RawAudioStream> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;
        let channel = state
            .channels
            .get_mut(&connection.channel)
            .filter(|c| c.connection_id == connection.id)
            .ok_or_else(|| Error::Connect(format!("connection {} is closed", connection.id)))?;

        let (tx, rx) = mpsc::channel(AUDIO_TAP_CAPACITY);
        channel.taps.entry(speaker.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn disconnect(&self, connection: ConnectionHandle) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Connect("loopback state poisoned".to_string()))?;

        let owned = state
            .channels
            .get(&connection.channel)
            .is_some_and(|c| c.connection_id == connection.id);
        if owned {
            state.channels.remove(&connection.channel);
            tracing::debug!(channel = %connection.channel, connection = connection.id, "loopback left");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelRef {
        ChannelRef::new("g", "c")
    }

    #[tokio::test]
    async fn test_join_and_fan_out() {
        let transport = LoopbackTransport::new();
        let channel = channel();
        let conn = transport.join(&channel).await.unwrap();

        let mut a = transport.subscribe(&conn.handle, "alice").unwrap();
        let mut b = transport.subscribe(&conn.handle, "alice").unwrap();

        let delivered = transport.push_audio(&channel, "alice", &[1, 2]).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap(), vec![1, 2]);
        assert_eq!(b.recv().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_closed_taps_are_pruned() {
        let transport = LoopbackTransport::new();
        let conn = transport.join(&channel()).await.unwrap();

        let tap = transport.subscribe(&conn.handle, "bob").unwrap();
        drop(tap);

        let delivered = transport.push_audio(&channel(), "bob", &[0, 0]).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(transport.open_taps(&channel(), "bob"), 0);
    }

    #[tokio::test]
    async fn test_failed_join() {
        let transport = LoopbackTransport::new();
        transport.set_join_behavior(JoinBehavior::Fail("denied".to_string()));

        let err = transport.join(&channel()).await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert!(!transport.is_connected(&channel()));
        assert_eq!(transport.join_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_closes_events() {
        let transport = LoopbackTransport::new();
        let mut conn = transport.join(&channel()).await.unwrap();

        assert!(transport.drop_connection(&channel()));
        assert!(!transport.drop_connection(&channel()));
        assert!(conn.events.recv().await.is_none());
        assert!(!transport.is_connected(&channel()));
    }

    #[tokio::test]
    async fn test_disconnect_closes_taps_and_events() {
        let transport = LoopbackTransport::new();
        let mut conn = transport.join(&channel()).await.unwrap();
        let mut tap = transport.subscribe(&conn.handle, "carol").unwrap();

        transport.disconnect(conn.handle.clone()).await.unwrap();

        assert!(tap.recv().await.is_none());
        assert!(conn.events.recv().await.is_none());
        assert!(transport.subscribe(&conn.handle, "carol").is_err());
    }
}
