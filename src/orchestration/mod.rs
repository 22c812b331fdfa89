//! System state tracker: aggregates every required participant's
//! self-reported [`ParticipantStatus`] into one deterministic [`SystemState`],
//! ported from the reference `SystemStateTracker`'s `ComputeSystemState` /
//! `ValidateParticipantStateUpdate`.

use std::collections::{HashMap, HashSet};

use log::warn;

use crate::structure::{ParticipantState, ParticipantStatus, SystemState};

/// `S(X)`: the set of participant states every required participant must be
/// in for the aggregate system state to become row `X`. Doubles as the
/// admissible-predecessor set used to validate an individual participant's
/// own transition into `X` (a single participant's own lifecycle reuses
/// this exact table).
///
/// `Invalid`, `Aborting` and `Error` have no row: `Invalid` is the initial
/// state, never a reported transition target; `Aborting`/`Error` dominate
/// unconditionally rather than being voted on (see `compute_system_state`).
pub fn admissible_predecessors(new_state: ParticipantState) -> Option<&'static [ParticipantState]> {
  use ParticipantState::*;
  Some(match new_state {
    ServicesCreated => &[ServicesCreated, CommunicationInitializing, CommunicationInitialized, ReadyToRun, Running],
    CommunicationInitializing => &[CommunicationInitializing, CommunicationInitialized, ReadyToRun, Running],
    CommunicationInitialized => &[CommunicationInitialized, ReadyToRun, Running],
    ReadyToRun => &[ReadyToRun, Running],
    Running => &[Running],
    Paused => &[Running, Paused],
    Stopping => &[Running, Paused, Stopping, Stopped, ShuttingDown, Shutdown],
    Stopped => &[Stopped, ShuttingDown, Shutdown],
    ShuttingDown => &[Stopped, ShuttingDown, Shutdown, Error, ServicesCreated, ReadyToRun],
    Shutdown => &[Shutdown],
    Invalid | Aborting | Error => return None,
  })
}

/// Whether `old -> new` is a transition this table considers valid. Purely
/// observational: callers log on `false` but still store the new state.
pub fn is_valid_transition(old: ParticipantState, new: ParticipantState) -> bool {
  admissible_predecessors(new).map_or(true, |preds| preds.contains(&old))
}

fn ps_row_to_system_state(ps: ParticipantState) -> SystemState {
  use ParticipantState as P;
  use SystemState as S;
  match ps {
    P::ServicesCreated => S::ServicesCreated,
    P::CommunicationInitializing => S::CommunicationInitializing,
    P::CommunicationInitialized => S::CommunicationInitialized,
    P::ReadyToRun => S::ReadyToRun,
    P::Running => S::Running,
    P::Paused => S::Paused,
    P::Stopping => S::Stopping,
    P::Stopped => S::Stopped,
    P::ShuttingDown => S::ShuttingDown,
    P::Shutdown => S::Shutdown,
    P::Invalid | P::Aborting | P::Error => S::Invalid,
  }
}

/// Rows in table order; used only to break ties deterministically
/// when more than one row's admissible set happens to hold (sizes in the
/// table are pairwise distinct in practice, so this mostly just fixes
/// iteration order).
const ROW_ORDER: [ParticipantState; 10] = [
  ParticipantState::ServicesCreated,
  ParticipantState::CommunicationInitializing,
  ParticipantState::CommunicationInitialized,
  ParticipantState::ReadyToRun,
  ParticipantState::Running,
  ParticipantState::Paused,
  ParticipantState::Stopping,
  ParticipantState::Stopped,
  ParticipantState::ShuttingDown,
  ParticipantState::Shutdown,
];

pub struct SystemStateTracker {
  required: HashSet<String>,
  status_cache: HashMap<String, ParticipantStatus>,
  system_state: SystemState,
}

impl SystemStateTracker {
  pub fn new() -> Self {
    SystemStateTracker { required: HashSet::new(), status_cache: HashMap::new(), system_state: SystemState::Invalid }
  }

  pub fn update_required_participants(&mut self, names: impl IntoIterator<Item = String>) {
    self.required = names.into_iter().collect();
  }

  pub fn is_required_participant(&self, name: &str) -> bool {
    self.required.contains(name)
  }

  pub fn required_participants(&self) -> impl Iterator<Item = &String> {
    self.required.iter()
  }

  pub fn get_participant_status(&self, name: &str) -> Option<&ParticipantStatus> {
    self.status_cache.get(name)
  }

  pub fn get_system_state(&self) -> SystemState {
    self.system_state
  }

  /// Folds in one participant's self-reported status. Returns the resulting
  /// (possibly unchanged) system state.
  pub fn update_participant_status(&mut self, status: ParticipantStatus) -> SystemState {
    let name = status.participant_name.clone();

    if let Some(prev) = self.status_cache.get(&name) {
      if prev.state == ParticipantState::Shutdown {
        // Shutdown is terminal; ignore anything reported after it.
        return self.system_state;
      }
      if !is_valid_transition(prev.state, status.state) {
        warn!("participant '{name}' reported an inadmissible transition {:?} -> {:?}", prev.state, status.state);
      }
    }

    let new_state = status.state;
    self.status_cache.insert(name, status);

    if self.required.is_empty() {
      return self.system_state;
    }
    if new_state == ParticipantState::Error {
      self.system_state = SystemState::Error;
      return self.system_state;
    }
    if new_state == ParticipantState::Aborting && self.system_state != SystemState::Error {
      self.system_state = SystemState::Aborting;
      return self.system_state;
    }

    self.recompute();
    self.system_state
  }

  /// Purge the peer, then recompute; an empty required set collapses
  /// to `Shutdown` if the tracker was mid-shutdown, else `Invalid`.
  pub fn remove_participant(&mut self, name: &str) -> SystemState {
    self.status_cache.remove(name);
    self.required.remove(name);

    if self.required.is_empty() {
      self.system_state = if self.system_state == SystemState::ShuttingDown { SystemState::Shutdown } else { SystemState::Invalid };
      return self.system_state;
    }

    if self.system_state != SystemState::Error {
      self.recompute();
    }
    self.system_state
  }

  /// `SS = X` iff every required participant's state is a member of `S(X)`.
  /// When several rows hold simultaneously (always nested in practice),
  /// the row with the smallest admissible set wins: it is the most specific
  /// description of "every required participant is at least this far along".
  fn recompute(&mut self) {
    let mut best: Option<(usize, SystemState)> = None;
    for &row in &ROW_ORDER {
      let Some(admissible) = admissible_predecessors(row) else { continue };
      let all_in = self.required.iter().all(|name| {
        let state = self.status_cache.get(name).map(|s| s.state).unwrap_or(ParticipantState::Invalid);
        admissible.contains(&state)
      });
      if all_in {
        let candidate = (admissible.len(), ps_row_to_system_state(row));
        if best.is_none_or(|(size, _)| candidate.0 < size) {
          best = Some(candidate);
        }
      }
    }
    if let Some((_, state)) = best {
      self.system_state = state;
    }
  }
}

impl Default for SystemStateTracker {
  fn default() -> Self {
    SystemStateTracker::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn status(name: &str, state: ParticipantState) -> ParticipantStatus {
    ParticipantStatus { participant_name: name.into(), state, enter_reason: String::new(), enter_time: 0, refresh_time: 0 }
  }

  #[test]
  fn aggregation_picks_most_specific_matching_row() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string(), "B".to_string(), "C".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Running));
    t.update_participant_status(status("B", ParticipantState::Running));
    assert_eq!(t.update_participant_status(status("C", ParticipantState::Paused)), SystemState::Paused);
    assert_eq!(t.update_participant_status(status("C", ParticipantState::Running)), SystemState::Running);
  }

  #[test]
  fn error_dominates_immediately() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string(), "B".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Running));
    assert_eq!(t.update_participant_status(status("B", ParticipantState::Error)), SystemState::Error);
  }

  #[test]
  fn aborting_does_not_override_existing_error() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Error));
    assert_eq!(t.update_participant_status(status("A", ParticipantState::Aborting)), SystemState::Error);
  }

  #[test]
  fn shutdown_is_terminal_and_further_updates_are_ignored() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Running));
    assert_eq!(t.update_participant_status(status("A", ParticipantState::Shutdown)), SystemState::Shutdown);
    assert_eq!(t.update_participant_status(status("A", ParticipantState::Running)), SystemState::Shutdown);
    assert_eq!(t.get_participant_status("A").unwrap().state, ParticipantState::Shutdown);
  }

  #[test]
  fn stop_sequence_matches_documented_scenario() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string(), "B".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Running));
    t.update_participant_status(status("B", ParticipantState::Running));
    assert_eq!(t.get_system_state(), SystemState::Running);

    assert_eq!(t.update_participant_status(status("A", ParticipantState::Stopping)), SystemState::Stopping);
    assert_eq!(t.update_participant_status(status("B", ParticipantState::Stopping)), SystemState::Stopping);
    assert_eq!(t.update_participant_status(status("A", ParticipantState::Stopped)), SystemState::Stopping);
    assert_eq!(t.update_participant_status(status("B", ParticipantState::Stopped)), SystemState::Stopped);
  }

  #[test]
  fn empty_required_set_after_removal_resolves_by_prior_state() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string()]);
    t.update_participant_status(status("A", ParticipantState::Stopping));
    t.system_state = SystemState::ShuttingDown;
    assert_eq!(t.remove_participant("A"), SystemState::Shutdown);
  }

  #[test]
  fn invalid_transition_is_logged_but_state_is_still_stored() {
    let mut t = SystemStateTracker::new();
    t.update_required_participants(["A".to_string()]);
    t.update_participant_status(status("A", ParticipantState::ServicesCreated));
    // Running's admissible set is {Running} only, so jumping straight from
    // ServicesCreated is not a valid predecessor -- logged, not rejected.
    t.update_participant_status(status("A", ParticipantState::Running));
    assert_eq!(t.get_participant_status("A").unwrap().state, ParticipantState::Running);
  }
}
