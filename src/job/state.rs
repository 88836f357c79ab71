//! Job lifecycle labels and the projection rule.
//!
//! A job's observable state is a pure function of what is on disk: the
//! presence of its image link, the presence of its script, and the
//! persisted state attribute. Transitions are requested as verbs and
//! persisted with an `"ed"` suffix appended.

/// Projected label while either the image link or the script is missing.
pub const NOT_READY: &str = "not ready";
/// Projected label once both inputs are present and no run was requested.
pub const READY: &str = "ready";
/// Persisted label written when a run's child process has exited.
pub const DONE: &str = "done";

/// Verb that requests a launch; persists as `started`.
pub(crate) const START_VERB: &str = "start";
/// Verb that marks a job stopped; persists as `stopped`. The running
/// child is not terminated.
pub(crate) const STOP_VERB: &str = "stop";
/// Verb the pipeline orchestrator stamps on freshly prepared stages.
/// Persists as `queueded`; the substring list filter still matches
/// `queued` against it.
pub(crate) const QUEUE_VERB: &str = "queued";

/// Verbs accepted from the external state interface.
pub(crate) const ALLOWED_VERBS: [&str; 2] = [START_VERB, STOP_VERB];

/// Derive the projected state from on-disk presence plus the persisted
/// label, if any.
pub fn project(image_present: bool, script_present: bool, persisted: Option<&str>) -> String {
    if !image_present || !script_present {
        return NOT_READY.to_string();
    }
    match persisted {
        Some(label) => label.to_string(),
        None => READY.to_string(),
    }
}

/// Persisted label for a transition verb.
pub(crate) fn label(verb: &str) -> String {
    format!("{verb}ed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_presence_rule() {
        assert_eq!(project(false, false, None), NOT_READY);
        assert_eq!(project(true, false, None), NOT_READY);
        assert_eq!(project(false, true, Some("started")), NOT_READY);
        assert_eq!(project(true, true, None), READY);
        assert_eq!(project(true, true, Some("started")), "started");
        assert_eq!(project(true, true, Some(DONE)), DONE);
    }

    #[test]
    fn test_label_suffix() {
        assert_eq!(label(START_VERB), "started");
        assert_eq!(label(STOP_VERB), "stopped");
        assert_eq!(label(QUEUE_VERB), "queueded");
    }

    #[test]
    fn test_queue_label_matches_filter() {
        assert!(label(QUEUE_VERB).contains("queued"));
    }
}
