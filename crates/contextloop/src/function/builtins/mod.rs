mod delegate;
mod files;
mod goal;

use std::sync::Arc;

pub use delegate::{Delegate, DelegateContext, delegate_name};
pub use files::{ListDirectory, ReadFile, WriteFile};
pub use goal::{GOAL_ACHIEVED, GOAL_FAILED, GoalAchieved, GoalFailed};

use crate::error::Error;
use crate::workspace::Workspace;

use super::{AgentFunction, FunctionSet};

/// Workspace-backed built-ins that agents can list in configuration.
pub const WORKSPACE_FUNCTIONS: [&str; 3] = ["read_file", "write_file", "list_directory"];

/// `on_goal_achieved` and `on_goal_failed`, offered on every turn.
pub fn terminal_functions() -> FunctionSet {
    FunctionSet::new()
        .with(Arc::new(GoalAchieved))
        .with(Arc::new(GoalFailed))
}

/// Build a workspace function by name.
pub fn workspace_function(name: &str, workspace: &Arc<Workspace>) -> Option<Arc<dyn AgentFunction>> {
    let function: Arc<dyn AgentFunction> = match name {
        "read_file" => Arc::new(ReadFile::new(Arc::clone(workspace))),
        "write_file" => Arc::new(WriteFile::new(Arc::clone(workspace))),
        "list_directory" => Arc::new(ListDirectory::new(Arc::clone(workspace))),
        _ => return None,
    };
    Some(function)
}

pub(crate) fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str, Error> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Agent(format!("missing string argument '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set_has_both_goal_functions() {
        let set = terminal_functions();
        assert_eq!(set.names().collect::<Vec<_>>(), [GOAL_ACHIEVED, GOAL_FAILED]);
    }

    #[test]
    fn workspace_functions_resolve_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Arc::new(Workspace::open(dir.path()).unwrap());
        for name in WORKSPACE_FUNCTIONS {
            let function = workspace_function(name, &ws).unwrap();
            assert_eq!(function.definition().name, name);
        }
        assert!(workspace_function("rm_rf", &ws).is_none());
    }
}
