//! Per-participant lifecycle state machine. Progression is
//! observational: an inadmissible transition is logged, never rejected,
//! because a required participant's stuck lifecycle must still be visible
//! to the system state tracker rather than silently swallowed.

use log::warn;

use crate::error::{VasioError, VasioResult};
use crate::orchestration::is_valid_transition;
use crate::structure::{ParticipantState, ParticipantStatus};

pub struct ParticipantLifecycle {
  participant_name: String,
  state: ParticipantState,
  enter_reason: String,
  enter_time: i64,
  refresh_time: i64,
}

impl ParticipantLifecycle {
  pub fn new(participant_name: impl Into<String>) -> Self {
    ParticipantLifecycle {
      participant_name: participant_name.into(),
      state: ParticipantState::Invalid,
      enter_reason: String::new(),
      enter_time: 0,
      refresh_time: 0,
    }
  }

  pub fn state(&self) -> ParticipantState {
    self.state
  }

  pub fn status(&self) -> ParticipantStatus {
    ParticipantStatus {
      participant_name: self.participant_name.clone(),
      state: self.state,
      enter_reason: self.enter_reason.clone(),
      enter_time: self.enter_time,
      refresh_time: self.refresh_time,
    }
  }

  /// General forward progression (ServicesCreated through Shutdown, plus
  /// Aborting/Error from anywhere). `Running ⇄ Paused` should go through
  /// [`Self::pause`]/[`Self::resume`] instead, which are edge-triggered.
  pub fn transition(&mut self, new_state: ParticipantState, reason: impl Into<String>, now_ns: i64) {
    if !is_valid_transition(self.state, new_state) {
      warn!(
        "participant '{}': inadmissible lifecycle transition {:?} -> {:?}",
        self.participant_name, self.state, new_state
      );
    }
    self.set_state(new_state, reason, now_ns);
  }

  pub fn pause(&mut self, reason: impl Into<String>, now_ns: i64) -> VasioResult<()> {
    if self.state != ParticipantState::Running {
      return Err(VasioError::StateTransition(format!(
        "participant '{}': Pause is only valid from Running, was {:?}",
        self.participant_name, self.state
      )));
    }
    self.set_state(ParticipantState::Paused, reason, now_ns);
    Ok(())
  }

  pub fn resume(&mut self, reason: impl Into<String>, now_ns: i64) -> VasioResult<()> {
    if self.state != ParticipantState::Paused {
      return Err(VasioError::StateTransition(format!(
        "participant '{}': Continue is only valid from Paused, was {:?}",
        self.participant_name, self.state
      )));
    }
    self.set_state(ParticipantState::Running, reason, now_ns);
    Ok(())
  }

  fn set_state(&mut self, new_state: ParticipantState, reason: impl Into<String>, now_ns: i64) {
    self.state = new_state;
    self.enter_reason = reason.into();
    self.enter_time = now_ns;
    self.refresh_time = now_ns;
  }

  /// Refreshes `refresh_time` without an actual state change, e.g. on a
  /// periodic heartbeat broadcast of the current status.
  pub fn touch(&mut self, now_ns: i64) {
    self.refresh_time = now_ns;
  }
}
