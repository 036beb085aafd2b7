//! Change notifications produced by watchers
//!
//! An [`Event`] is a single notification from a source: a container runtime
//! action or a file action. [`Action`] is a bitmask so related actions can be
//! matched as a group (wake/sleep masks).

use std::fmt;
use std::ops::BitOr;

/// Source kind of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Docker,
    File,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Docker => write!(f, "docker"),
            EventKind::File => write!(f, "file"),
        }
    }
}

/// Bitmask of change actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action(u16);

impl Action {
    pub const FILE_WRITTEN: Action = Action(1 << 0);
    pub const FILE_CREATED: Action = Action(1 << 1);
    pub const FILE_DELETED: Action = Action(1 << 2);
    pub const FILE_RENAMED: Action = Action(1 << 3);

    pub const CONTAINER_CREATE: Action = Action(1 << 4);
    pub const CONTAINER_START: Action = Action(1 << 5);
    pub const CONTAINER_UNPAUSE: Action = Action(1 << 6);

    pub const CONTAINER_KILL: Action = Action(1 << 7);
    pub const CONTAINER_STOP: Action = Action(1 << 8);
    pub const CONTAINER_PAUSE: Action = Action(1 << 9);
    pub const CONTAINER_DIE: Action = Action(1 << 10);
    pub const CONTAINER_DESTROY: Action = Action(1 << 11);

    /// Synthetic action used by the reload trigger and by the docker watcher
    /// after a stream reconnect; matches every route.
    pub const FORCE_RELOAD: Action = Action(1 << 12);

    const WAKE_MASK: u16 = Self::CONTAINER_CREATE.0 | Self::CONTAINER_START.0 | Self::CONTAINER_UNPAUSE.0;
    const SLEEP_MASK: u16 = Self::CONTAINER_KILL.0
        | Self::CONTAINER_STOP.0
        | Self::CONTAINER_PAUSE.0
        | Self::CONTAINER_DIE.0
        | Self::CONTAINER_DESTROY.0;

    pub fn intersects(self, other: Action) -> bool {
        self.0 & other.0 != 0
    }

    /// The container came (back) to life
    pub fn is_container_wake(self) -> bool {
        self.0 & Self::WAKE_MASK != 0
    }

    /// The container went away
    pub fn is_container_sleep(self) -> bool {
        self.0 & Self::SLEEP_MASK != 0
    }

    pub fn is_force_reload(self) -> bool {
        self == Self::FORCE_RELOAD
    }

    /// Map a docker event-stream action name to an [`Action`]. Actions the
    /// reconciler does not care about map to `None`.
    pub fn from_docker(action: &str) -> Option<Action> {
        match action {
            "create" => Some(Self::CONTAINER_CREATE),
            "start" => Some(Self::CONTAINER_START),
            "unpause" => Some(Self::CONTAINER_UNPAUSE),
            "kill" => Some(Self::CONTAINER_KILL),
            "stop" => Some(Self::CONTAINER_STOP),
            "pause" => Some(Self::CONTAINER_PAUSE),
            "die" => Some(Self::CONTAINER_DIE),
            "destroy" => Some(Self::CONTAINER_DESTROY),
            _ => None,
        }
    }
}

impl BitOr for Action {
    type Output = Action;

    fn bitor(self, rhs: Action) -> Action {
        Action(self.0 | rhs.0)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Action::FILE_WRITTEN => "written",
            Action::FILE_CREATED => "created",
            Action::FILE_DELETED => "deleted",
            Action::FILE_RENAMED => "renamed",
            Action::CONTAINER_CREATE => "create",
            Action::CONTAINER_START => "start",
            Action::CONTAINER_UNPAUSE => "unpause",
            Action::CONTAINER_KILL => "kill",
            Action::CONTAINER_STOP => "stop",
            Action::CONTAINER_PAUSE => "pause",
            Action::CONTAINER_DIE => "die",
            Action::CONTAINER_DESTROY => "destroy",
            Action::FORCE_RELOAD => "force_reload",
            _ => "unknown",
        };
        write!(f, "{name}")
    }
}

/// A single change notification. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// docker: container id; file: empty
    pub actor_id: String,
    /// docker: container name; file: path relative to the watched directory
    pub actor_name: String,
    pub action: Action,
}

impl Event {
    pub fn force_reload() -> Self {
        Self {
            kind: EventKind::Docker,
            actor_id: String::new(),
            actor_name: String::new(),
            action: Action::FORCE_RELOAD,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.actor_name, self.action, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_action_mapping() {
        assert_eq!(Action::from_docker("start"), Some(Action::CONTAINER_START));
        assert_eq!(Action::from_docker("die"), Some(Action::CONTAINER_DIE));
        assert_eq!(Action::from_docker("attach"), None);
        assert_eq!(Action::from_docker("exec_create"), None);
    }

    #[test]
    fn test_wake_sleep_masks() {
        assert!(Action::CONTAINER_START.is_container_wake());
        assert!(Action::CONTAINER_UNPAUSE.is_container_wake());
        assert!(!Action::CONTAINER_START.is_container_sleep());

        assert!(Action::CONTAINER_DIE.is_container_sleep());
        assert!(Action::CONTAINER_KILL.is_container_sleep());
        assert!(!Action::CONTAINER_DIE.is_container_wake());

        assert!(!Action::FILE_WRITTEN.is_container_wake());
        assert!(!Action::FILE_WRITTEN.is_container_sleep());
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::CONTAINER_DIE.to_string(), "die");
        assert_eq!(Action::FILE_WRITTEN.to_string(), "written");
        assert_eq!(
            Event::force_reload().action.to_string(),
            "force_reload"
        );
    }
}
