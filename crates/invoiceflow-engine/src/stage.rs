//! The fixed stage graph.
//!
//! ```text
//! INTAKE → UNDERSTAND → PREPARE → RETRIEVE → MATCH ─┬─────────────────────────────────┐
//!                                                   └→ CHECKPOINT_HITL ⇢ HITL_DECISION ─┤
//!                                                                                       ↓
//!                              COMPLETE ← NOTIFY ← POSTING ← APPROVE ← RECONCILE ←──────┘
//! ```
//!
//! `⇢` is the suspend edge: the instance pauses and only an external
//! verdict moves it on. Every node's permitted exits are listed in
//! [`Stage::permits`]; the executor refuses anything else.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One node of the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Intake,
    Understand,
    Prepare,
    Retrieve,
    Match,
    CheckpointHitl,
    HitlDecision,
    Reconcile,
    Approve,
    Posting,
    Notify,
    Complete,
}

impl Stage {
    /// All stages in topological order.
    pub const ALL: [Stage; 12] = [
        Stage::Intake,
        Stage::Understand,
        Stage::Prepare,
        Stage::Retrieve,
        Stage::Match,
        Stage::CheckpointHitl,
        Stage::HitlDecision,
        Stage::Reconcile,
        Stage::Approve,
        Stage::Posting,
        Stage::Notify,
        Stage::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "INTAKE",
            Self::Understand => "UNDERSTAND",
            Self::Prepare => "PREPARE",
            Self::Retrieve => "RETRIEVE",
            Self::Match => "MATCH",
            Self::CheckpointHitl => "CHECKPOINT_HITL",
            Self::HitlDecision => "HITL_DECISION",
            Self::Reconcile => "RECONCILE",
            Self::Approve => "APPROVE",
            Self::Posting => "POSTING",
            Self::Notify => "NOTIFY",
            Self::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Whether a stage returning `transition` is a legal move from `self`.
    pub fn permits(self, transition: &Transition) -> bool {
        use Stage::*;
        match (self, transition) {
            (Intake, Transition::Next { stage: Understand })
            | (Understand, Transition::Next { stage: Prepare })
            | (Prepare, Transition::Next { stage: Retrieve })
            | (Retrieve, Transition::Next { stage: Match })
            | (Match, Transition::Next { stage: Reconcile | CheckpointHitl })
            | (CheckpointHitl, Transition::Suspend { stage: HitlDecision })
            | (HitlDecision, Transition::Next { stage: Reconcile })
            | (HitlDecision, Transition::Fail { .. })
            | (Reconcile, Transition::Next { stage: Approve })
            | (Approve, Transition::Next { stage: Posting })
            | (Posting, Transition::Next { stage: Notify })
            | (Notify, Transition::Next { stage: Complete })
            | (Complete, Transition::Finish) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a stage sends the instance once it returns successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    /// Continue with `stage`.
    Next { stage: Stage },
    /// Pause; `stage` runs once an external verdict arrives.
    Suspend { stage: Stage },
    /// The workflow is done.
    Finish,
    /// Terminal failure decided by the stage itself (e.g. a rejected invoice).
    Fail { reason: String },
}

impl Transition {
    pub fn next(stage: Stage) -> Self {
        Self::Next { stage }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next { stage } => write!(f, "-> {stage}"),
            Self::Suspend { stage } => write!(f, "suspend until {stage}"),
            Self::Finish => f.write_str("finish"),
            Self::Fail { reason } => write!(f, "fail ({reason})"),
        }
    }
}
