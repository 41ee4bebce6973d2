//! The engine loop: the single place where game state mutates.
//!
//! Presentation commands, player hits, round countdowns and peer
//! lifecycle notices all arrive over channels and are handled one at a
//! time, so the round scheduler itself needs no locking.

use crate::domain::classifier::ClassifierFactory;
use crate::domain::game::{GameError, GameState, IDENTIFY_PULSE};
use crate::domain::models::{CoreEvent, GameSignal, PeerId, PlayerId, UsageSlot};
use crate::domain::settings::SyncFailurePolicy;
use crate::infrastructure::manager::{BandManager, ManagerNotice};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Commands issued by the presentation layer.
#[derive(Debug)]
pub enum Command {
    StartMatch {
        rounds: i32,
        reply: oneshot::Sender<Result<(), GameError>>,
    },
    AttachBand {
        peer: PeerId,
        player: PlayerId,
        slot: UsageSlot,
    },
    DetachBand {
        peer: PeerId,
    },
    ResetCalibration {
        peer: PeerId,
    },
    PulseBand {
        peer: PeerId,
    },
    Shutdown,
}

/// Cloneable front door to a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub async fn start_match(&self, rounds: i32) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::StartMatch { rounds, reply })
            .map_err(|_| anyhow::anyhow!("engine is not running"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("engine dropped the request"))??;
        Ok(())
    }

    pub fn attach_band(&self, peer: PeerId, player: PlayerId, slot: UsageSlot) {
        let _ = self.commands.send(Command::AttachBand { peer, player, slot });
    }

    pub fn detach_band(&self, peer: PeerId) {
        let _ = self.commands.send(Command::DetachBand { peer });
    }

    pub fn reset_calibration(&self, peer: PeerId) {
        let _ = self.commands.send(Command::ResetCalibration { peer });
    }

    pub fn pulse_band(&self, peer: PeerId) {
        let _ = self.commands.send(Command::PulseBand { peer });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Everything [`build`] wires together.
pub struct EngineParts {
    pub engine: Engine,
    pub handle: EngineHandle,
    pub manager: Arc<BandManager>,
    pub events: mpsc::UnboundedReceiver<CoreEvent>,
}

/// Wire up a core: spawn `engine.run()` on the runtime, hand `manager`
/// to the discovery glue and consume `events` in the presentation layer.
pub fn build(
    classifiers: Arc<dyn ClassifierFactory>,
    sync_failure_policy: SyncFailurePolicy,
) -> EngineParts {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();

    let manager = BandManager::new(event_tx.clone(), notice_tx, sync_failure_policy);
    let game = GameState::new(classifiers, signal_tx, event_tx.clone());

    EngineParts {
        engine: Engine {
            game,
            manager: manager.clone(),
            commands: command_rx,
            signals: signal_rx,
            notices: notice_rx,
            events: event_tx,
        },
        handle: EngineHandle {
            commands: command_tx,
        },
        manager,
        events: event_rx,
    }
}

pub struct Engine {
    game: GameState,
    manager: Arc<BandManager>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<GameSignal>,
    notices: mpsc::UnboundedReceiver<ManagerNotice>,
    events: mpsc::UnboundedSender<CoreEvent>,
}

impl Engine {
    pub async fn run(mut self) {
        info!("engine loop started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal),
                Some(notice) = self.notices.recv() => self.handle_notice(notice),
            }
        }
        self.game.cleanup();
        self.manager.cleanup();
        info!("engine loop stopped");
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartMatch { rounds, reply } => {
                let result = self.game.start(rounds);
                if let Err(e) = &result {
                    warn!("match start rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::AttachBand { peer, player, slot } => match self.manager.device(peer) {
                Some(device) => {
                    if let Err(e) = self.game.attach_band(device, player, slot) {
                        warn!("attach of peer {:#x} rejected: {}", peer, e);
                    }
                }
                None => warn!("attach for unknown peer {:#x}", peer),
            },
            Command::DetachBand { peer } => {
                self.game.detach_band(peer);
            }
            Command::ResetCalibration { peer } => {
                if let Some(device) = self.manager.device(peer) {
                    device.reset_calibration();
                }
            }
            Command::PulseBand { peer } => {
                if let Some(device) = self.manager.device(peer) {
                    if let Err(e) = device.pulse(&IDENTIFY_PULSE) {
                        warn!("pulse of peer {:#x} failed: {}", peer, e);
                    }
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn handle_signal(&mut self, signal: GameSignal) {
        match signal {
            GameSignal::PlayerHit(player) => self.game.on_player_hit(player),
            GameSignal::RoundTimeout { seq } => self.game.on_round_timeout(seq),
        }
    }

    fn handle_notice(&mut self, notice: ManagerNotice) {
        match notice {
            ManagerNotice::BandReady(peer) => {
                if let Some(device) = self.manager.device(peer) {
                    device.start_listening();
                    let _ = self.events.send(CoreEvent::BandFound {
                        peer,
                        identity: device.identity(),
                    });
                }
            }
            ManagerNotice::BandLost(peer) => {
                // A lost band leaves its player immediately; the player
                // itself goes too when it was the last one.
                self.game.detach_band(peer);
                let _ = self.events.send(CoreEvent::BandLost { peer });
            }
        }
    }
}
