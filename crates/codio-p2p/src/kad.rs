//! Kademlia provider lookups and announcements.
//!
//! The swarm is owned by whichever task drives it (a worker in the browser,
//! a tokio task natively). The resolver never touches it directly: it
//! sends a [`DhtCommand`] through [`ChannelDht`], and the swarm task feeds
//! `kad` events to a [`KademliaBridge`], which forwards provider reports
//! to the waiting stream.
//!
//! Provider records are keyed by the multihash, so CIDv0 and CIDv1 of the
//! same content share providers.

use std::collections::HashMap;

use async_trait::async_trait;
use codio_core::ContentId;
use futures::channel::mpsc;
use libp2p::kad::{self, store::MemoryStore, QueryId, RecordKey};
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::directory::{DhtBackend, DhtProviderEvent, DirectoryError};
use crate::{boxed_stream, BoxedStream};

/// DHT key under which providers of `cid` are announced.
pub fn record_key(cid: &ContentId) -> RecordKey {
    RecordKey::new(&cid.multihash_bytes())
}

/// Request from a [`ChannelDht`] to the swarm task.
#[derive(Debug)]
pub enum DhtCommand {
    FindProviders {
        key: RecordKey,
        events: mpsc::UnboundedSender<DhtProviderEvent>,
    },
    StartProviding {
        key: RecordKey,
    },
}

/// [`DhtBackend`] that delegates to a swarm task over a channel.
#[derive(Clone)]
pub struct ChannelDht {
    commands: mpsc::UnboundedSender<DhtCommand>,
}

impl ChannelDht {
    /// Returns the backend and the receiving end for the swarm task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DhtCommand>) {
        let (commands, rx) = mpsc::unbounded();
        (Self { commands }, rx)
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl DhtBackend for ChannelDht {
    async fn lookup(
        &self,
        key: RecordKey,
    ) -> Result<BoxedStream<DhtProviderEvent>, DirectoryError> {
        let (tx, rx) = mpsc::unbounded();
        self.commands
            .unbounded_send(DhtCommand::FindProviders { key, events: tx })
            .map_err(|_| DirectoryError::Unavailable("swarm task has stopped".to_string()))?;
        Ok(boxed_stream(rx))
    }

    async fn provide(&self, key: RecordKey) -> Result<(), DirectoryError> {
        self.commands
            .unbounded_send(DhtCommand::StartProviding { key })
            .map_err(|_| DirectoryError::Unavailable("swarm task has stopped".to_string()))
    }
}

struct PendingLookup {
    events: mpsc::UnboundedSender<DhtProviderEvent>,
    started: Instant,
    reported: usize,
}

/// Routes `GetProviders` progress into per-query streams.
#[derive(Default)]
pub struct KademliaBridge {
    pending: HashMap<QueryId, PendingLookup>,
}

impl KademliaBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    pub fn handle_command(&mut self, kademlia: &mut kad::Behaviour<MemoryStore>, command: DhtCommand) {
        match command {
            DhtCommand::FindProviders { key, events } => {
                let id = kademlia.get_providers(key);
                debug!(query = ?id, "Started provider query");
                self.pending.insert(
                    id,
                    PendingLookup {
                        events,
                        started: Instant::now(),
                        reported: 0,
                    },
                );
            }
            DhtCommand::StartProviding { key } => match kademlia.start_providing(key) {
                Ok(id) => debug!(query = ?id, "Started provider announcement"),
                Err(e) => warn!(error = %e, "Could not announce provider record"),
            },
        }
    }

    /// Feed one Kademlia event. Returns `true` if it belonged to a query
    /// started by this bridge.
    pub fn on_kad_event(&mut self, event: &kad::Event) -> bool {
        let kad::Event::OutboundQueryProgressed {
            id,
            result: kad::QueryResult::GetProviders(result),
            step,
            ..
        } = event
        else {
            return false;
        };
        let Some(pending) = self.pending.get_mut(id) else {
            return false;
        };

        let mut receiver_gone = false;
        match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                for peer in providers {
                    pending.reported += 1;
                    trace!(query = ?id, %peer, "Provider found");
                    if pending
                        .events
                        .unbounded_send(DhtProviderEvent::new(*peer))
                        .is_err()
                    {
                        receiver_gone = true;
                        break;
                    }
                }
            }
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
            Err(e) => {
                debug!(query = ?id, error = %e, "Provider query ended with error");
            }
        }

        if step.last || receiver_gone {
            if let Some(done) = self.pending.remove(id) {
                debug!(
                    query = ?id,
                    providers = done.reported,
                    elapsed_ms = done.started.elapsed().as_millis() as u64,
                    "Provider query finished"
                );
            }
        }
        true
    }

    /// Stop queries nobody is listening to any more.
    pub fn finish_abandoned(&mut self, kademlia: &mut kad::Behaviour<MemoryStore>) -> usize {
        let abandoned: Vec<QueryId> = self
            .pending
            .iter()
            .filter(|(_, lookup)| lookup.events.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &abandoned {
            if let Some(mut query) = kademlia.query_mut(id) {
                query.finish();
            }
            self.pending.remove(id);
        }
        abandoned.len()
    }
}
