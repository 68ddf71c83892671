//! State machine: legality of transitions for one module.

use crate::error::IllegalTransitionError;

/// Lifecycle state of a single registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    NotInstalled,
    Loaded,
    Installed,
    Started,
    Stopped,
    Error,
}

impl ModuleState {
    /// `true` once a module has at least been installed — the threshold at
    /// which dependency presence starts to matter.
    pub fn is_at_least_installed(self) -> bool {
        matches!(self, ModuleState::Installed | ModuleState::Started)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleState::NotInstalled => "not_installed",
            ModuleState::Loaded => "loaded",
            ModuleState::Installed => "installed",
            ModuleState::Started => "started",
            ModuleState::Stopped => "stopped",
            ModuleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Checks and applies the legal transitions for a module's lifecycle.
/// Pure and stateless: the Registry owns the actual per-entry state.
pub struct StateMachine;

impl StateMachine {
    /// Returns the resulting state for `action` from `from`, or an
    /// `IllegalTransitionError` if the move is not in the legal transition
    /// table.
    pub fn apply(
        module: &str,
        from: ModuleState,
        action: Action,
    ) -> Result<ModuleState, IllegalTransitionError> {
        use Action::*;
        use ModuleState::*;

        let to = match (from, action) {
            (NotInstalled, Load) => Loaded,
            (Loaded, Install) => Installed,
            (Installed, Start) => Started,
            (Started, Stop) => Stopped,
            (Stopped, Start) => Started,
            (Stopped, Uninstall) => Loaded,
            (Installed, Uninstall) => Loaded,
            (Loaded, Unload) => NotInstalled,
            // `Fail` is legal from any state; it always lands on Error.
            (_, Fail) => Error,
            _ => {
                return Err(IllegalTransitionError {
                    module: module.to_string(),
                    from,
                    action: action.as_str(),
                })
            }
        };
        Ok(to)
    }
}

/// The action driving a transition. `Reset` is handled by the Registry
/// directly (it restores `last_stable_state`, which the state machine
/// alone has no record of) rather than through `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Load,
    Install,
    Start,
    Stop,
    Uninstall,
    Unload,
    Fail,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Load => "load",
            Action::Install => "install",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Uninstall => "uninstall",
            Action::Unload => "unload",
            Action::Fail => "fail",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ModuleState::*;

    #[test]
    fn legal_chain_succeeds() {
        assert_eq!(StateMachine::apply("m", NotInstalled, Action::Load).unwrap(), Loaded);
        assert_eq!(StateMachine::apply("m", Loaded, Action::Install).unwrap(), Installed);
        assert_eq!(StateMachine::apply("m", Installed, Action::Start).unwrap(), Started);
        assert_eq!(StateMachine::apply("m", Started, Action::Stop).unwrap(), Stopped);
        assert_eq!(StateMachine::apply("m", Stopped, Action::Start).unwrap(), Started);
    }

    #[test]
    fn uninstall_from_stopped_or_installed_returns_to_loaded() {
        assert_eq!(StateMachine::apply("m", Stopped, Action::Uninstall).unwrap(), Loaded);
        assert_eq!(StateMachine::apply("m", Installed, Action::Uninstall).unwrap(), Loaded);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let err = StateMachine::apply("m", NotInstalled, Action::Start).unwrap_err();
        assert_eq!(err.module, "m");
        assert_eq!(err.from, NotInstalled);
        assert_eq!(err.action, "start");
    }

    #[test]
    fn fail_is_legal_from_any_state() {
        for s in [NotInstalled, Loaded, Installed, Started, Stopped, Error] {
            assert_eq!(StateMachine::apply("m", s, Action::Fail).unwrap(), Error);
        }
    }
}
