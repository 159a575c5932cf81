use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport_adapter::PeerId;

/// The join message the host holds while a peer is being checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub peer: PeerId,
    pub player_name: String,
    pub payload: Vec<u8>,
}

/// Disconnect reasons the host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    TicketCanceled,
    NotInGroup,
}

/// The host's join path. A held join ends in at most one of these calls;
/// one superseded by a newer request from the same peer ends in neither.
#[async_trait]
pub trait JoinPipeline: Send + Sync {
    async fn release_join(&self, peer: PeerId, request: JoinRequest);

    async fn cancel_join(&self, peer: PeerId, reason: JoinRejection);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Released(PeerId),
    Canceled(PeerId, JoinRejection),
}

/// Join pipeline that only records what it was asked to do.
pub struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
    notify: mpsc::UnboundedSender<HostEvent>,
}

impl RecordingHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (notify, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: Mutex::new(Vec::new()),
                notify,
            },
            rx,
        )
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: HostEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        let _ = self.notify.send(event);
    }
}

#[async_trait]
impl JoinPipeline for RecordingHost {
    async fn release_join(&self, peer: PeerId, _request: JoinRequest) {
        self.record(HostEvent::Released(peer));
    }

    async fn cancel_join(&self, peer: PeerId, reason: JoinRejection) {
        self.record(HostEvent::Canceled(peer, reason));
    }
}
