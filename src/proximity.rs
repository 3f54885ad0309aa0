//! Proximity classification.
//!
//! Infers whether the user is physically present or talking remotely by
//! comparing the current turn's embedding against four fixed anchor
//! descriptions. Transition anchors (arriving, leaving) resolve immediately to
//! the resting state they lead to, so only `Physical` and `Remote` are ever
//! current.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ProximityConfig;
use crate::embedder::{cosine_similarity, Embedder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProximityState {
    Physical,
    Remote,
    TransitionAway,
    TransitionToward,
}

impl ProximityState {
    pub const ALL: [ProximityState; 4] = [
        ProximityState::Physical,
        ProximityState::Remote,
        ProximityState::TransitionAway,
        ProximityState::TransitionToward,
    ];

    /// The resting state a detected state settles into.
    pub fn resolve(self) -> ProximityState {
        match self {
            ProximityState::TransitionAway => ProximityState::Remote,
            ProximityState::TransitionToward => ProximityState::Physical,
            resting => resting,
        }
    }

    /// Canonical description embedded as this state's anchor.
    pub fn anchor_text(self) -> &'static str {
        match self {
            ProximityState::Physical => {
                "user is sitting together physical presence face to face in the same room close proximity intimate"
            }
            ProximityState::Remote => {
                "user is texting chatting remotely over phone messaging app discord far away not present"
            }
            ProximityState::TransitionAway => {
                "user is leaving walking away exiting saying goodbye going out departing"
            }
            ProximityState::TransitionToward => {
                "user is arriving entering the room sitting down coming closer approaching"
            }
        }
    }

    fn description(self) -> String {
        match self {
            ProximityState::Physical => "AI is right next to them.".to_string(),
            ProximityState::Remote => {
                "AI is speaking through messages or thinking.".to_string()
            }
            other => format!("Current proximity state: {}", other),
        }
    }
}

impl fmt::Display for ProximityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProximityState::Physical => "PHYSICAL",
            ProximityState::Remote => "REMOTE",
            ProximityState::TransitionAway => "TRANSITION_AWAY",
            ProximityState::TransitionToward => "TRANSITION_TOWARD",
        };
        f.write_str(s)
    }
}

/// Similarity of one turn to each anchor, in [`ProximityState::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorScores(pub [f32; 4]);

impl AnchorScores {
    /// Highest-scoring anchor. Ties go to the earlier state in [`ProximityState::ALL`].
    pub fn best(&self) -> (ProximityState, f32) {
        let mut best = (ProximityState::ALL[0], self.0[0]);
        for (state, score) in ProximityState::ALL.iter().zip(self.0.iter()).skip(1) {
            if *score > best.1 {
                best = (*state, *score);
            }
        }
        best
    }
}

/// Result of classifying one turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    /// Current resting state after this turn.
    pub state: ProximityState,
    /// Whether the current state changed.
    pub changed: bool,
    /// Best-matching anchor before resolution.
    pub anchor: ProximityState,
    pub confidence: f32,
}

/// Per-conversation classifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifierSession {
    pub current_state: ProximityState,
    pub last_emitted_state: Option<ProximityState>,
}

impl Default for ClassifierSession {
    fn default() -> Self {
        Self {
            current_state: ProximityState::Remote,
            last_emitted_state: None,
        }
    }
}

/// Nearest-anchor proximity classifier with emission hysteresis.
pub struct ProximityClassifier {
    embedder: Arc<dyn Embedder>,
    anchors: Vec<(ProximityState, Vec<f32>)>,
    config: ProximityConfig,
    session: ClassifierSession,
}

impl ProximityClassifier {
    /// Embed the four anchors once. They never change afterwards.
    pub fn new(embedder: Arc<dyn Embedder>, config: ProximityConfig) -> Self {
        let texts: Vec<&str> = ProximityState::ALL.iter().map(|s| s.anchor_text()).collect();
        let vectors = embedder.embed_documents(&texts);
        let anchors = ProximityState::ALL.iter().copied().zip(vectors).collect();

        Self {
            embedder,
            anchors,
            config,
            session: ClassifierSession::default(),
        }
    }

    /// Classify `turn`, blending in `prior` when the turn is too short to carry signal.
    pub fn detect_state(&mut self, turn: &str, prior: &str) -> Detection {
        let short = turn.chars().count() < self.config.short_turn_chars;
        let text = if short && !prior.trim().is_empty() {
            format!("{} {}", prior, turn)
        } else {
            turn.to_string()
        };

        let vector = self.embedder.embed_query(&text);
        let scores = self.score(&vector);
        self.resolve_scores(scores)
    }

    /// Cosine similarity of `vector` to each anchor.
    pub fn score(&self, vector: &[f32]) -> AnchorScores {
        let mut scores = [0.0f32; 4];
        for (slot, (_, anchor)) in scores.iter_mut().zip(self.anchors.iter()) {
            *slot = cosine_similarity(vector, anchor);
        }
        AnchorScores(scores)
    }

    /// Apply the confidence gate and transition collapsing to precomputed scores.
    pub fn resolve_scores(&mut self, scores: AnchorScores) -> Detection {
        let (anchor, confidence) = scores.best();
        let current = self.session.current_state;

        if confidence <= self.config.threshold {
            if self.config.log_skipped_transitions {
                info!(
                    anchor = %anchor,
                    confidence,
                    threshold = self.config.threshold,
                    current = %current,
                    "Low-confidence proximity turn ignored"
                );
            }
            return Detection {
                state: current,
                changed: false,
                anchor,
                confidence,
            };
        }

        let resolved = anchor.resolve();
        let changed = resolved != current;
        self.session.current_state = resolved;

        if changed {
            info!(
                from = %current,
                to = %resolved,
                anchor = %anchor,
                confidence,
                "Proximity state changed"
            );
        } else {
            debug!(state = %resolved, confidence, "Proximity state confirmed");
        }

        Detection {
            state: resolved,
            changed,
            anchor,
            confidence,
        }
    }

    /// Description of the current state, only on the first turn or after a change.
    pub fn emission_block(&mut self, is_first_turn: bool) -> Option<String> {
        let current = self.session.current_state;
        if !is_first_turn && self.session.last_emitted_state == Some(current) {
            return None;
        }
        self.session.last_emitted_state = Some(current);
        Some(current.description())
    }

    pub fn current_state(&self) -> ProximityState {
        self.session.current_state
    }

    pub fn session(&self) -> &ClassifierSession {
        &self.session
    }

    /// Start a new conversation session.
    pub fn reset(&mut self) {
        self.session = ClassifierSession::default();
    }
}
