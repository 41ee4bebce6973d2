//! The round scheduler: the authoritative game loop.
//!
//! All methods run on the engine loop; asynchronous inputs (player hits,
//! the round countdown) arrive as [`GameSignal`]s. A round is replayed
//! when nobody scores, and only counted rounds consume the budget.

use crate::domain::classifier::ClassifierFactory;
use crate::domain::gestures::{self, ALL_GESTURES_MASK};
use crate::domain::models::{CoreEvent, GameSignal, GestureMask, PeerId, PlayerId, UsageSlot};
use crate::domain::player::PlayerState;
use crate::infrastructure::band::BandDevice;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long players get to perform the announced gesture.
pub const ROUND_TIME: Duration = Duration::from_secs(5);

/// Haptic pattern played on the winner's bands.
pub const WINNER_PULSE: [u8; 8] = [0x01, 0x01, 0x8a, 0x01, 0x01, 0x8a, 0x01, 0x01];

/// Plain tap used to point out a single band.
pub const IDENTIFY_PULSE: [u8; 8] = [0x01; 8];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GameError {
    #[error("a match needs at least one round")]
    NoRounds,
    #[error("a match is already running")]
    MatchInProgress,
    #[error("no players have bands attached")]
    NoPlayers,
    #[error("players share no common gestures")]
    NoCommonGestures,
    #[error("player id must be greater than zero")]
    InvalidPlayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundPhase {
    Idle,
    Armed,
    Resolving,
}

pub struct GameState {
    players: HashMap<PlayerId, Arc<PlayerState>>,
    classifiers: Arc<dyn ClassifierFactory>,
    signals: UnboundedSender<GameSignal>,
    events: UnboundedSender<CoreEvent>,
    allowed: GestureMask,
    prev_gesture: u32,
    rounds_left: u32,
    hits_this_round: usize,
    phase: RoundPhase,
    /// Bumped whenever a round is (re)armed; a countdown signal from an
    /// older round is stale and ignored.
    round_seq: u64,
    timeout: Option<JoinHandle<()>>,
}

impl GameState {
    pub fn new(
        classifiers: Arc<dyn ClassifierFactory>,
        signals: UnboundedSender<GameSignal>,
        events: UnboundedSender<CoreEvent>,
    ) -> Self {
        Self {
            players: HashMap::new(),
            classifiers,
            signals,
            events,
            allowed: 0,
            prev_gesture: 0,
            rounds_left: 0,
            hits_this_round: 0,
            phase: RoundPhase::Idle,
            round_seq: 0,
            timeout: None,
        }
    }

    pub fn running(&self) -> bool {
        self.rounds_left > 0 || self.phase != RoundPhase::Idle
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        let mut ids: Vec<_> = self.players.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn player(&self, id: PlayerId) -> Option<Arc<PlayerState>> {
        self.players.get(&id).cloned()
    }

    /// Counted rounds still to play.
    pub fn rounds_left(&self) -> u32 {
        self.rounds_left
    }

    /// Associate a band with a player's usage slot, creating the player
    /// on first use.
    pub fn attach_band(
        &mut self,
        band: Arc<BandDevice>,
        player: PlayerId,
        slot: UsageSlot,
    ) -> Result<(), GameError> {
        if player == 0 {
            return Err(GameError::InvalidPlayer);
        }
        info!("band {} joins player {} as {}", band.identity(), player, slot.label());
        let state = self.players.entry(player).or_insert_with(|| {
            PlayerState::new(player, self.classifiers.create(), self.signals.clone())
        });
        state.attach(band, slot);
        self.emit_player_list();
        Ok(())
    }

    /// Drop a band from whichever player wears it; a player stripped of
    /// its last band leaves the game. Returns whether anything changed.
    pub fn detach_band(&mut self, peer: PeerId) -> bool {
        let mut changed = false;
        self.players.retain(|id, player| {
            if player.detach(peer) {
                changed = true;
            }
            let keep = player.has_bands();
            if !keep {
                info!("player {} lost its last band", id);
                player.cleanup();
            }
            keep
        });
        if changed {
            self.emit_player_list();
        }
        changed
    }

    /// Narrow every player's detector to the gestures all of them can
    /// perform with their current bands.
    fn prune_bands(&mut self) {
        let mut common = ALL_GESTURES_MASK;
        for player in self.players.values() {
            common &= player.available_gestures();
        }
        for player in self.players.values() {
            player.enable_gestures(common);
        }
        self.allowed = common;
    }

    /// Begin a match of `rounds` counted rounds.
    pub fn start(&mut self, rounds: i32) -> Result<(), GameError> {
        if rounds <= 0 {
            return Err(GameError::NoRounds);
        }
        if self.running() {
            return Err(GameError::MatchInProgress);
        }
        if self.players.is_empty() {
            return Err(GameError::NoPlayers);
        }
        self.prune_bands();
        if self.allowed == 0 {
            return Err(GameError::NoCommonGestures);
        }

        info!("match started: {} rounds, {} players", rounds, self.players.len());
        self.prev_gesture = 0;
        self.rounds_left = rounds as u32;
        self.start_next_round();
        Ok(())
    }

    fn start_next_round(&mut self) {
        let gesture = match gestures::pick_gesture(
            self.allowed,
            self.prev_gesture,
            &mut rand::thread_rng(),
        ) {
            Some(gesture) => gesture,
            None => {
                warn!("no gesture available any more, abandoning match");
                self.rounds_left = 0;
                self.phase = RoundPhase::Idle;
                let _ = self.events.send(CoreEvent::MatchFinished { winner: None });
                return;
            }
        };
        self.prev_gesture = gesture;

        info!(
            "{} rounds left, next gesture: {} ({})",
            self.rounds_left,
            gesture,
            gestures::gesture_name(gesture)
        );

        for player in self.players.values() {
            player.arm(1u64 << gesture);
        }
        self.hits_this_round = 0;
        self.phase = RoundPhase::Armed;
        self.arm_timeout();
        let _ = self.events.send(CoreEvent::RoundStarted { gesture });
    }

    fn arm_timeout(&mut self) {
        self.round_seq += 1;
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
        let seq = self.round_seq;
        let signals = self.signals.clone();
        self.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(ROUND_TIME).await;
            let _ = signals.send(GameSignal::RoundTimeout { seq });
        }));
    }

    /// A player's sample path reported a match against its wanted mask.
    pub fn on_player_hit(&mut self, player: PlayerId) {
        if self.phase != RoundPhase::Armed {
            debug!("late hit from player {} ignored", player);
            return;
        }
        info!("player {} finished the gesture", player);
        let _ = self.events.send(CoreEvent::PlayerHit { player });

        self.hits_this_round += 1;
        if self.hits_this_round >= self.players.len() {
            // Everybody scored: take the countdown out of play. If it
            // fired in the meantime its signal carries a stale seq.
            if let Some(handle) = self.timeout.take() {
                handle.abort();
            }
            self.resolve_round();
        }
    }

    /// The round countdown fired.
    pub fn on_round_timeout(&mut self, seq: u64) {
        if seq != self.round_seq || self.phase != RoundPhase::Armed {
            debug!("stale round timeout ignored");
            return;
        }
        self.timeout = None;
        self.resolve_round();
    }

    fn resolve_round(&mut self) {
        self.phase = RoundPhase::Resolving;

        let mut reference: Option<i64> = None;
        for player in self.players.values() {
            player.stop_waiting();
            if let Some(ts) = player.hit_timestamp() {
                reference = Some(match reference {
                    Some(best) => best.min(ts),
                    None => ts,
                });
            }
        }

        let Some(reference) = reference else {
            // Nobody scored: replay the round, it does not count.
            info!("no player completed the gesture, restarting round");
            self.start_next_round();
            return;
        };

        for player in self.players.values() {
            player.update_round_totals(reference);
        }

        self.rounds_left -= 1;
        if self.rounds_left > 0 {
            self.start_next_round();
        } else {
            self.finish_match();
        }
    }

    fn finish_match(&mut self) {
        self.phase = RoundPhase::Idle;
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }

        let mut best: Option<&Arc<PlayerState>> = None;
        for player in self.players.values() {
            // A player that never completed a gesture cannot win.
            if player.completed_hits() == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    player.completed_hits() > current.completed_hits()
                        || (player.completed_hits() == current.completed_hits()
                            && player.delay_sum() < current.delay_sum())
                }
            };
            if better {
                best = Some(player);
            }
        }

        let winner = best.map(|player| player.id());
        match best {
            Some(player) => {
                info!("match result: player {} won", player.id());
                player.pulse_all(&WINNER_PULSE);
            }
            None => warn!("match ended without a single completed gesture, no winner"),
        }
        let _ = self.events.send(CoreEvent::MatchFinished { winner });
    }

    fn emit_player_list(&self) {
        let _ = self.events.send(CoreEvent::PlayerListChanged {
            players: self.player_ids(),
        });
    }

    pub fn cleanup(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
        for player in self.players.values() {
            player.cleanup();
        }
        self.players.clear();
        self.phase = RoundPhase::Idle;
        self.rounds_left = 0;
    }
}
