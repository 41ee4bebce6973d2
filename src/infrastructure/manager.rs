//! Registry of band peers and clock-sync election bookkeeping.
//!
//! Peers start life as a pending entry the moment they are noticed and
//! become identified devices once a link is opened for them. The manager
//! also owns the two pieces of shared sync state — the elected master
//! peer and the group token — behind a single lock.

use crate::domain::models::{CoreEvent, PeerId};
use crate::domain::settings::SyncFailurePolicy;
use crate::infrastructure::band::BandDevice;
use crate::infrastructure::timesync::{ClockRole, GROUP_TOKEN_LEN};
use crate::infrastructure::transport::PeerLink;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Lifecycle notices for the engine loop.
#[derive(Debug, Clone, Copy)]
pub enum ManagerNotice {
    BandReady(PeerId),
    BandLost(PeerId),
}

enum PeerEntry {
    /// Noticed but not yet backed by an open link.
    Pending,
    Identified(Arc<BandDevice>),
}

struct Election {
    master: Option<PeerId>,
    group_token: [u8; GROUP_TOKEN_LEN],
}

pub struct BandManager {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    election: Mutex<Election>,
    events: UnboundedSender<CoreEvent>,
    notices: UnboundedSender<ManagerNotice>,
    sync_failure_policy: SyncFailurePolicy,
}

impl BandManager {
    pub fn new(
        events: UnboundedSender<CoreEvent>,
        notices: UnboundedSender<ManagerNotice>,
        sync_failure_policy: SyncFailurePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            election: Mutex::new(Election {
                master: None,
                group_token: rand::thread_rng().gen(),
            }),
            events,
            notices,
            sync_failure_policy,
        })
    }

    /// Take note of a discovered peer and open its link. Duplicate
    /// notices for a known peer are ignored.
    pub fn notice_peer(self: &Arc<Self>, peer: PeerId, name: &str, link: Arc<dyn PeerLink>) {
        {
            let mut peers = self.peers.lock().unwrap();
            if peers.contains_key(&peer) {
                return;
            }
            peers.insert(peer, PeerEntry::Pending);
        }
        info!("new peer {:#x} ({})", peer, name);

        let device = BandDevice::new(
            peer,
            name.to_string(),
            link,
            Arc::downgrade(self),
            self.events.clone(),
        );
        {
            // Identified before opening: link events may fire while
            // `open` is still on the stack.
            let mut peers = self.peers.lock().unwrap();
            match peers.get_mut(&peer) {
                Some(entry) => *entry = PeerEntry::Identified(device.clone()),
                // Discovery already rejected the peer.
                None => return,
            }
        }
        if let Err(e) = device.open() {
            warn!("peer {:#x}: connect failed: {}", peer, e);
            self.peers.lock().unwrap().remove(&peer);
        }
    }

    pub fn device(&self, peer: PeerId) -> Option<Arc<BandDevice>> {
        match self.peers.lock().unwrap().get(&peer) {
            Some(PeerEntry::Identified(device)) => Some(device.clone()),
            _ => None,
        }
    }

    pub fn devices(&self) -> Vec<Arc<BandDevice>> {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter_map(|entry| match entry {
                PeerEntry::Identified(device) => Some(device.clone()),
                PeerEntry::Pending => None,
            })
            .collect()
    }

    /// Peer currently holding the timing master role.
    pub fn master(&self) -> Option<PeerId> {
        self.election.lock().unwrap().master
    }

    pub fn group_token(&self) -> [u8; GROUP_TOKEN_LEN] {
        self.election.lock().unwrap().group_token
    }

    pub(crate) fn sync_failure_policy(&self) -> SyncFailurePolicy {
        self.sync_failure_policy
    }

    /// Election point: the first peer to ask while no master exists
    /// takes the role, everyone else becomes a slave.
    pub(crate) fn claim_role(&self, peer: PeerId) -> ClockRole {
        let mut election = self.election.lock().unwrap();
        match election.master {
            Some(master) => {
                debug!("peer {:#x} follows master {:#x}", peer, master);
                ClockRole::Slave
            }
            None => {
                election.master = Some(peer);
                info!("peer {:#x} claims the timing master role", peer);
                ClockRole::Master
            }
        }
    }

    pub(crate) fn peer_ready(&self, peer: PeerId) {
        let _ = self.notices.send(ManagerNotice::BandReady(peer));
    }

    /// Remove a peer. Losing the master clears the role, issues a fresh
    /// group token and restarts every remaining peer's negotiation.
    pub(crate) fn drop_peer(&self, peer: PeerId) {
        let removed = self.peers.lock().unwrap().remove(&peer);
        let device = match removed {
            Some(PeerEntry::Identified(device)) => Some(device),
            Some(PeerEntry::Pending) => None,
            None => return,
        };
        if let Some(device) = &device {
            device.cleanup();
        }

        let was_master = {
            let mut election = self.election.lock().unwrap();
            if election.master == Some(peer) {
                election.master = None;
                true
            } else {
                false
            }
        };
        info!(
            "peer {:#x} lost{}",
            peer,
            if was_master { " (was timing master)" } else { "" }
        );

        if was_master {
            let remaining = self.devices();
            if !remaining.is_empty() {
                self.election.lock().unwrap().group_token = rand::thread_rng().gen();
                info!("re-electing timing master across {} peers", remaining.len());
            }
            for device in remaining {
                device.restart_sync();
            }
        }

        let _ = self.notices.send(ManagerNotice::BandLost(peer));
    }

    pub fn cleanup(&self) {
        let devices: Vec<_> = {
            let mut peers = self.peers.lock().unwrap();
            peers
                .drain()
                .filter_map(|(_, entry)| match entry {
                    PeerEntry::Identified(device) => Some(device),
                    PeerEntry::Pending => None,
                })
                .collect()
        };
        for device in devices {
            device.cleanup();
        }
    }
}
