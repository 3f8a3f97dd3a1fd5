use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media type tags used by task outputs.
pub mod output_type {
    pub const VIDEO_MP4: &str = "video/mp4";
    pub const TEXT_CSV: &str = "text/csv";
    pub const TEXT_STDOUT: &str = "text/stdout";
    pub const TEXT_STDERR: &str = "text/stderr";
    pub const TEXT_DETECTION: &str = "text/detection";
}

/// Task lifecycle state, persisted by its integer wire value.
///
/// `Undefined` is reserved for records whose persisted state value is not
/// recognised; it is never assigned by any transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum TaskState {
    Undefined,
    Pending,
    Started,
    Canceled,
    Finished,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Started)
    }

    /// Whether `self -> next` is in the permitted transition graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Started)
                | (TaskState::Pending, TaskState::Canceled)
                | (TaskState::Pending, TaskState::Failed)
                | (TaskState::Started, TaskState::Finished)
                | (TaskState::Started, TaskState::Canceled)
                | (TaskState::Started, TaskState::Failed)
        )
    }
}

impl From<TaskState> for i8 {
    fn from(state: TaskState) -> i8 {
        match state {
            TaskState::Undefined => -1,
            TaskState::Pending => 0,
            TaskState::Started => 1,
            TaskState::Canceled => 2,
            TaskState::Finished => 3,
            TaskState::Failed => 4,
        }
    }
}

impl From<i8> for TaskState {
    fn from(value: i8) -> TaskState {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Started,
            2 => TaskState::Canceled,
            3 => TaskState::Finished,
            4 => TaskState::Failed,
            _ => TaskState::Undefined,
        }
    }
}

/// A persisted unit of work.
///
/// `id`, `name`, `params` and `createdat` are fixed at submission; the
/// control block (`state`, `reason`, `progress`) is owned by the driver via
/// the task registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub state: TaskState,
    pub reason: String,
    pub progress: f64,
    pub createdat: DateTime<Utc>,
}

impl TaskItem {
    pub fn new(name: &str, params: BTreeMap<String, String>, reason: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            params,
            state: TaskState::Pending,
            reason: reason.to_string(),
            progress: 0.0,
            createdat: Utc::now(),
        }
    }
}

/// A named artifact produced by a task.
///
/// The file itself lives at `<outputs dir>/<name>`; the catalog entry and
/// the file are created and removed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub taskid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub desc: String,
    pub createdat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TaskOutput {
    pub fn new(
        taskid: &str,
        name: &str,
        media_type: &str,
        desc: &str,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            taskid: taskid.to_string(),
            name: name.to_string(),
            media_type: media_type.to_string(),
            desc: desc.to_string(),
            createdat: Utc::now(),
            metadata,
        }
    }
}

/// A CCTV entry: a logical name and the coordinate used to resolve its
/// current playlist URL on demand. The URL itself is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CctvStream {
    pub id: String,
    pub name: String,
    pub coordx: f64,
    pub coordy: f64,
    pub avail: bool,
}

impl CctvStream {
    pub fn new(name: &str, coordx: f64, coordy: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            coordx,
            coordy,
            avail: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_state_wire_values_round_trip() {
        for (state, value) in [
            (TaskState::Undefined, -1),
            (TaskState::Pending, 0),
            (TaskState::Started, 1),
            (TaskState::Canceled, 2),
            (TaskState::Finished, 3),
            (TaskState::Failed, 4),
        ] {
            assert_eq!(i8::from(state), value);
            assert_eq!(TaskState::from(value), state);
        }
    }

    #[test]
    fn test_unknown_wire_value_is_undefined() {
        assert_eq!(TaskState::from(17), TaskState::Undefined);
        assert_eq!(TaskState::from(-2), TaskState::Undefined);
    }

    #[test]
    fn test_state_serializes_as_integer() {
        let json = serde_json::to_string(&TaskState::Finished).unwrap();
        assert_eq!(json, "3");

        let state: TaskState = serde_json::from_str("1").unwrap();
        assert_eq!(state, TaskState::Started);
    }

    #[test]
    fn test_permitted_transitions() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Started));
        assert!(TaskState::Pending.can_transition_to(TaskState::Canceled));
        assert!(TaskState::Pending.can_transition_to(TaskState::Failed));
        assert!(TaskState::Started.can_transition_to(TaskState::Finished));
        assert!(TaskState::Started.can_transition_to(TaskState::Canceled));
        assert!(TaskState::Started.can_transition_to(TaskState::Failed));
    }

    #[test]
    fn test_no_transition_out_of_terminal_states() {
        let all = [
            TaskState::Undefined,
            TaskState::Pending,
            TaskState::Started,
            TaskState::Canceled,
            TaskState::Finished,
            TaskState::Failed,
        ];
        for terminal in [
            TaskState::Canceled,
            TaskState::Finished,
            TaskState::Failed,
            TaskState::Undefined,
        ] {
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pending_cannot_finish_directly() {
        assert!(!TaskState::Pending.can_transition_to(TaskState::Finished));
    }

    #[test]
    fn test_task_item_round_trip() {
        let mut params = BTreeMap::new();
        params.insert("cctv".to_string(), "[A] demo".to_string());

        let task = TaskItem::new("record", params, "waiting for the recording window");
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskItem = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.state, TaskState::Pending);
        assert_eq!(back.params["cctv"], "[A] demo");
    }

    #[test]
    fn test_output_type_field_name() {
        let output = TaskOutput::new("t1", "t1.mp4", output_type::VIDEO_MP4, "", BTreeMap::new());
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains("\"type\":\"video/mp4\""));
    }
}
