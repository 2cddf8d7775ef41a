//! State Machine (§4.4): pure functions from (current state, event) to
//! (new state, side effects to request). The scheduler performs the side
//! effects; nothing here touches I/O.
use chrono::{DateTime, Duration, Utc};

use crate::decoder::{is_api_error, is_complete, review_complete, ReviewOutcome, StreamEvent};
use crate::worker::model::{ReviewStatus, WorkerState};

const INTERVENTION_GRACE: i64 = 5 * 60; // 5 minutes, in seconds (§4.4).

/// A side effect the state machine asks the scheduler to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetPr { number: u64, url: String },
    SetReviewStatus(ReviewStatus),
    Nudge(String),
    EscalateToError(String),
}

/// Outcome of feeding one decoded stream event through the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next_state: WorkerState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: WorkerState) -> Self {
        Transition {
            next_state: state,
            effects: vec![],
        }
    }
}

/// Input the detector needs beyond the raw event: whether a PR is already
/// known, and the current review status, since detection rule 2/3 depend on
/// them (§4.4).
pub struct DetectContext {
    pub state: WorkerState,
    pub has_pr: bool,
    pub review_status: ReviewStatus,
}

/// Apply detection rules in order, first match wins (§4.4). Pure, and
/// idempotent for the same `(ctx, event)` pair (P7).
pub fn detect(ctx: &DetectContext, event: &StreamEvent) -> Transition {
    // Rule 1: API error -> ERROR, from any non-terminal state.
    if is_api_error(event) {
        let msg = match event {
            StreamEvent::Assistant(_) => "assistant reported an API error".to_string(),
            StreamEvent::Result { .. } => "result reported is_error=true".to_string(),
            _ => "api error".to_string(),
        };
        return Transition {
            next_state: WorkerState::Error,
            effects: vec![Effect::EscalateToError(msg)],
        };
    }

    // Rule 1.5: first stream activity while SPAWNING -> INITIALIZING. The
    // process only reaches this point once it has attached and produced at
    // least one decoded event.
    if ctx.state == WorkerState::Spawning {
        return Transition::stay(WorkerState::Initializing);
    }

    // Rule 2: PR URL seen while not already PR_OPEN/REVIEWING/MERGING/MERGED.
    if let StreamEvent::Assistant(msg) = event {
        if !matches!(
            ctx.state,
            WorkerState::PrOpen | WorkerState::Reviewing | WorkerState::Merging | WorkerState::Merged
        ) {
            if let Some(url) = crate::decoder::extract_pr_url(msg) {
                if let Some(number) = crate::decoder::extract_pr_number(&url) {
                    return Transition {
                        next_state: WorkerState::PrOpen,
                        effects: vec![Effect::SetPr { number, url }],
                    };
                }
            }
        }
    }

    // Rule 3: review banner.
    if ctx.review_status == ReviewStatus::Pending {
        match review_complete(event) {
            ReviewOutcome::Passed => {
                return Transition {
                    next_state: WorkerState::PrOpen,
                    effects: vec![Effect::SetReviewStatus(ReviewStatus::Passed)],
                };
            }
            ReviewOutcome::Failed => {
                return Transition {
                    next_state: WorkerState::PrOpen,
                    effects: vec![Effect::SetReviewStatus(ReviewStatus::Failed)],
                };
            }
            ReviewOutcome::None => {}
        }
    }

    // Rule 4: tool-use while INITIALIZING -> WORKING.
    if ctx.state == WorkerState::Initializing {
        if let StreamEvent::Assistant(msg) = event {
            if crate::decoder::has_tool_use(msg) {
                return Transition::stay(WorkerState::Working);
            }
        }
    }

    // Rule 5: end_turn without a PR -> no transition.
    if is_complete(event) && !ctx.has_pr {
        return Transition::stay(ctx.state);
    }

    Transition::stay(ctx.state)
}

/// Intervention policy (§4.4): nudge a stale WORKING worker, or declare a
/// stale SPAWNING/INITIALIZING worker unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    None,
    Nudge,
    Escalate,
}

pub fn check_staleness(state: WorkerState, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Intervention {
    let idle = now - last_activity;
    if idle < Duration::seconds(INTERVENTION_GRACE) {
        return Intervention::None;
    }
    match state {
        WorkerState::Working => Intervention::Nudge,
        WorkerState::Spawning | WorkerState::Initializing => Intervention::Escalate,
        _ => Intervention::None,
    }
}

/// I3: validate that a proposed transition is legal.
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), (WorkerState, WorkerState)> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err((from, to))
    }
}
