//! Virtual-time synchronization: the `NextSimTask` barrier exchange,
//! own-duration vs. minimal-duration step semantics, and dynamic step-size
//! changes that take effect on the next broadcast.

use std::collections::HashMap;

use crate::error::{VasioError, VasioResult};
pub use crate::wire::messages::NextSimTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  ByOwnDuration,
  ByMinimalDuration,
}

/// Per-step barrier bookkeeping. Ported from the
/// reference time-sync service's peer table: one entry per coordinated peer,
/// seeded to `{0, configuredStep}` until a real announcement arrives.
pub struct TimeSyncService {
  mode: SyncMode,
  own_duration_ns: i64,
  pending_duration_ns: Option<i64>,
  current_now_ns: i64,
  next_task: HashMap<String, NextSimTask>,
}

impl TimeSyncService {
  pub fn new(mode: SyncMode, initial_duration_ns: i64) -> VasioResult<Self> {
    if initial_duration_ns == 0 {
      return Err(VasioError::Configuration("step duration must be non-zero".into()));
    }
    Ok(TimeSyncService {
      mode,
      own_duration_ns: initial_duration_ns,
      pending_duration_ns: None,
      current_now_ns: 0,
      next_task: HashMap::new(),
    })
  }

  pub fn mode(&self) -> SyncMode {
    self.mode
  }

  pub fn current_now_ns(&self) -> i64 {
    self.current_now_ns
  }

  pub fn own_duration_ns(&self) -> i64 {
    self.own_duration_ns
  }

  /// "initially `{0, configuredStep}`" -- a peer not yet heard from is
  /// assumed to be running at this participant's own current step.
  pub fn add_coordinated_peer(&mut self, name: impl Into<String>) {
    self.next_task.entry(name.into()).or_insert(NextSimTask { time_point_ns: 0, duration_ns: self.own_duration_ns });
  }

  pub fn remove_coordinated_peer(&mut self, name: &str) {
    self.next_task.remove(name);
  }

  pub fn coordinated_peer_count(&self) -> usize {
    self.next_task.len()
  }

  /// Takes effect from the *next* `NextSimTask` broadcast; rejects a
  /// zero duration synchronously rather than silently stalling the barrier.
  pub fn set_step_duration(&mut self, new_duration_ns: i64) -> VasioResult<()> {
    if new_duration_ns == 0 {
      return Err(VasioError::Configuration("step duration must be non-zero".into()));
    }
    self.pending_duration_ns = Some(new_duration_ns);
    Ok(())
  }

  /// Records the NextSimTask last announced by a coordinated peer.
  pub fn on_peer_next_sim_task(&mut self, peer_name: impl Into<String>, task: NextSimTask) {
    self.next_task.insert(peer_name.into(), task);
  }

  /// The `now` this participant intends to advance to next, given the
  /// duration its own mode currently implies.
  pub fn my_next_now(&self) -> i64 {
    self.current_now_ns + self.step_duration_for_next_advance()
  }

  fn step_duration_for_next_advance(&self) -> i64 {
    match self.mode {
      SyncMode::ByOwnDuration => self.own_duration_ns,
      SyncMode::ByMinimalDuration => self.next_task.values().map(|t| t.duration_ns).fold(self.own_duration_ns, i64::min),
    }
  }

  /// The duration the *next* completed step will advance by, i.e. what a
  /// step handler invoked right now would be told as its `duration` argument
  /// -- the handler observes `(now, duration)` before the step is
  /// considered complete.
  pub fn pending_step_duration_ns(&self) -> i64 {
    self.step_duration_for_next_advance()
  }

  /// Barrier release condition: every coordinated peer has announced
  /// a `now` at least as far along as this participant's own next candidate.
  pub fn barrier_satisfied(&self) -> bool {
    let my_next_now = self.my_next_now();
    self.next_task.values().all(|t| t.time_point_ns >= my_next_now)
  }

  /// Completes the current step: applies a pending `SetStepDuration`, advances
  /// `current_now_ns`, and returns the `NextSimTask` to broadcast --
  /// own-duration announces its own `now+d, d`; minimal-duration
  /// announces `now+minObservedD` but still reports its own `d`.
  pub fn complete_step(&mut self) -> NextSimTask {
    if let Some(pending) = self.pending_duration_ns.take() {
      self.own_duration_ns = pending;
    }
    let advance = self.step_duration_for_next_advance();
    self.current_now_ns += advance;
    NextSimTask { time_point_ns: self.current_now_ns, duration_ns: self.own_duration_ns }
  }
}

/// Blocking step handler: invoked on the participant's own simulation thread;
/// its return signals step completion and barrier readiness.
pub type BlockingStepHandler = dyn FnMut(i64, i64) + Send;

/// Async step handler: returns immediately; the caller must later invoke the
/// paired completion callback (`CompleteSimulationStep`) from any thread.
pub type AsyncStepHandler = dyn FnMut(i64, i64) + Send;

#[derive(Default)]
pub enum StepHandlerKind {
  #[default]
  None,
  Blocking(Box<BlockingStepHandler>),
  Async(Box<AsyncStepHandler>),
}

#[cfg(test)]
mod tests {
  use super::*;

  /// A tiny, deterministic multi-participant driver used only by these
  /// tests: each tick, every coordinated participant that has reached
  /// barrier-release re-broadcasts its `NextSimTask` to every other
  /// participant and records the `now` its step handler fired at.
  struct Sim {
    services: Vec<(String, TimeSyncService)>,
    fired_at: Vec<Vec<i64>>,
  }

  impl Sim {
    fn new(participants: Vec<(&str, i64, SyncMode)>) -> Self {
      let names: Vec<&str> = participants.iter().map(|(n, _, _)| *n).collect();
      let mut services = Vec::new();
      for (name, step, mode) in &participants {
        let mut svc = TimeSyncService::new(*mode, *step).unwrap();
        for other in &names {
          if other != name {
            svc.add_coordinated_peer(*other);
          }
        }
        services.push((name.to_string(), svc));
      }
      let fired_at = vec![Vec::new(); services.len()];
      Sim { services, fired_at }
    }

    /// Runs until every participant's virtual clock has passed `until_ns`.
    fn run_until(&mut self, until_ns: i64) {
      loop {
        if self.services.iter().all(|(_, s)| s.current_now_ns() >= until_ns) {
          break;
        }
        for i in 0..self.services.len() {
          if !self.services[i].1.barrier_satisfied() {
            continue;
          }
          let task = self.services[i].1.complete_step();
          self.fired_at[i].push(self.services[i].1.current_now_ns());
          let name = self.services[i].0.clone();
          for (j, (_, other)) in self.services.iter_mut().enumerate() {
            if j != i {
              other.on_peer_next_sim_task(&name, task);
            }
          }
        }
      }
    }
  }

  #[test]
  fn own_duration_fires_every_configured_step() {
    let mut sim = Sim::new(vec![("Solo", 1_000_000, SyncMode::ByOwnDuration)]);
    sim.run_until(5_000_000);
    assert_eq!(sim.fired_at[0], vec![1_000_000, 2_000_000, 3_000_000, 4_000_000, 5_000_000]);
  }

  #[test]
  fn minimal_duration_participant_fires_union_of_finer_peers() {
    // A: 2ms, B: 3ms, C: 4ms-but-minimal -- C's handler should fire at the
    // union of both finer peers' grids up to the stop time.
    let mut sim = Sim::new(vec![
      ("A", 2_000_000, SyncMode::ByOwnDuration),
      ("B", 3_000_000, SyncMode::ByOwnDuration),
      ("C", 4_000_000, SyncMode::ByMinimalDuration),
    ]);
    sim.run_until(12_000_000);

    let mut expected: Vec<i64> = (1..=6).map(|k| k * 2_000_000).chain((1..=4).map(|k| k * 3_000_000)).collect();
    expected.sort_unstable();
    expected.dedup();

    let c_index = 2;
    assert_eq!(sim.fired_at[c_index], expected);
  }

  #[test]
  fn dynamic_step_size_change_takes_effect_next_broadcast() {
    let mut svc = TimeSyncService::new(SyncMode::ByOwnDuration, 1_000_000).unwrap();
    let mut fired = Vec::new();
    for _ in 0..10 {
      let task = svc.complete_step();
      fired.push(task.time_point_ns);
      if task.time_point_ns == 10_000_000 {
        svc.set_step_duration(10_000_000).unwrap();
      }
    }
    for _ in 0..4 {
      let task = svc.complete_step();
      fired.push(task.time_point_ns);
      if task.time_point_ns == 90_000_000 {
        svc.set_step_duration(2_000_000).unwrap();
      }
    }
    for _ in 0..4 {
      fired.push(svc.complete_step().time_point_ns);
    }

    let expected: Vec<i64> = vec![
      1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40, 50, 60, 70, 80, 90, 92, 94, 96, 98,
    ]
    .into_iter()
    .map(|ms| ms * 1_000_000)
    .collect();
    assert_eq!(fired, expected);
  }

  #[test]
  fn zero_duration_is_rejected() {
    assert!(TimeSyncService::new(SyncMode::ByOwnDuration, 0).is_err());
    let mut svc = TimeSyncService::new(SyncMode::ByOwnDuration, 1).unwrap();
    assert!(svc.set_step_duration(0).is_err());
  }
}
