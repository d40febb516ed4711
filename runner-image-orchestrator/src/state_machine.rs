use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of one build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildState {
    Init,
    ResourcesReady,
    VmLaunching,
    VmActive,
    BuildSignaled,
    Snapshotting,
    SnapshotReady,
    Rotated,
    Done,
    Aborted,
}

impl BuildState {
    const ORDER: [BuildState; 9] = [
        BuildState::Init,
        BuildState::ResourcesReady,
        BuildState::VmLaunching,
        BuildState::VmActive,
        BuildState::BuildSignaled,
        BuildState::Snapshotting,
        BuildState::SnapshotReady,
        BuildState::Rotated,
        BuildState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Init => "INIT",
            BuildState::ResourcesReady => "RESOURCES_READY",
            BuildState::VmLaunching => "VM_LAUNCHING",
            BuildState::VmActive => "VM_ACTIVE",
            BuildState::BuildSignaled => "BUILD_SIGNALED",
            BuildState::Snapshotting => "SNAPSHOTTING",
            BuildState::SnapshotReady => "SNAPSHOT_READY",
            BuildState::Rotated => "ROTATED",
            BuildState::Done => "DONE",
            BuildState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Aborted)
    }

    /// Forward by exactly one step, or to ABORTED from any non-terminal state.
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == BuildState::Aborted {
            return true;
        }
        let pos = |s: BuildState| Self::ORDER.iter().position(|o| *o == s);
        match (pos(*self), pos(next)) {
            (Some(a), Some(b)) => b == a + 1,
            _ => false,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: BuildState,
    pub to: BuildState,
    pub reason: String,
}

/// Tracks and logs the state of one build run.
#[derive(Debug)]
pub struct BuildRun {
    run_id: Uuid,
    state: BuildState,
    started: Instant,
    history: Vec<Transition>,
}

impl BuildRun {
    pub fn new(run_id: Uuid) -> Self {
        tracing::info!("[state_machine] run {} starting in {}", run_id, BuildState::Init);
        Self {
            run_id,
            state: BuildState::Init,
            started: Instant::now(),
            history: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Move to `to`. Returns false (and logs) if the transition is not allowed.
    pub fn transition(&mut self, to: BuildState, reason: &str) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            tracing::warn!(
                "[state_machine] run {}: refusing {} -> {} ({})",
                self.run_id,
                from,
                to,
                reason
            );
            return false;
        }
        tracing::info!(
            "[state_machine] run {}: {} -> {} after {:?} ({})",
            self.run_id,
            from,
            to,
            self.started.elapsed(),
            reason
        );
        self.state = to;
        self.history.push(Transition {
            from,
            to,
            reason: reason.to_string(),
        });
        true
    }

    pub fn abort(&mut self, reason: &str) -> bool {
        self.transition(BuildState::Aborted, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_walks_every_state() {
        let mut run = BuildRun::new(Uuid::new_v4());
        for next in &BuildState::ORDER[1..] {
            assert!(run.transition(*next, "ok"));
        }
        assert_eq!(run.state(), BuildState::Done);
        assert_eq!(run.history().len(), 8);
        assert!(!run.abort("too late"));
    }

    #[tokio::test]
    async fn skipping_states_is_refused() {
        let mut run = BuildRun::new(Uuid::new_v4());
        assert!(!run.transition(BuildState::VmActive, "skip"));
        assert_eq!(run.state(), BuildState::Init);
        assert!(run.transition(BuildState::ResourcesReady, "ok"));
        assert!(!run.transition(BuildState::Init, "back"));
    }

    #[tokio::test]
    async fn abort_from_any_non_terminal_state() {
        for stop in &BuildState::ORDER[..8] {
            let mut run = BuildRun::new(Uuid::new_v4());
            for next in BuildState::ORDER[1..].iter().take_while(|s| *s != stop) {
                run.transition(*next, "ok");
            }
            if *stop != BuildState::Init {
                run.transition(*stop, "ok");
            }
            assert!(run.abort("boom"), "abort from {}", stop);
            assert_eq!(run.state(), BuildState::Aborted);
            assert!(!run.transition(BuildState::Done, "after abort"));
        }
    }
}
