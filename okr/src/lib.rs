//! Personal OKR engine: a strict Goal → Strategy → Objective → Key Result → Initiative → Task
//! hierarchy with progress that aggregates up the tree, and a single global work timer.
//! The store is the only writer; persistence and presentation read committed snapshots.

pub mod core {
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serialize};
    use std::{fmt, str::FromStr};
    use uuid::Uuid;

    pub const MAX_PROGRESS: u8 = 100;
    pub const MAX_RATING: u8 = 5;

    /* ------------------------------- IDs ------------------------------- */

    /// Opaque node identifier. Generated ids look like `1735689600000-3f2a9c1b`;
    /// imported ids of any shape are kept verbatim.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub String);

    impl NodeId {
        pub fn generate(now: DateTime<Utc>) -> Self {
            let suffix = Uuid::new_v4().simple().to_string();
            Self(format!("{}-{}", now.timestamp_millis(), &suffix[..8]))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for NodeId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl From<String> for NodeId {
        fn from(s: String) -> Self {
            Self(s)
        }
    }

    /// The node map. Insertion-ordered so snapshots serialize deterministically.
    pub type NodeMap = IndexMap<NodeId, Node>;

    /* ---------------------------- Hierarchy levels ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NodeType {
        Goal,
        Strategy,
        Objective,
        KeyResult,
        Initiative,
        Task,
    }

    impl NodeType {
        /// The level a new child of this node gets by default. Tasks nest under tasks
        /// (logged sessions are child tasks).
        pub fn child_type(self) -> NodeType {
            match self {
                NodeType::Goal => NodeType::Strategy,
                NodeType::Strategy => NodeType::Objective,
                NodeType::Objective => NodeType::KeyResult,
                NodeType::KeyResult => NodeType::Initiative,
                NodeType::Initiative | NodeType::Task => NodeType::Task,
            }
        }

        /// Leaf-level work that the timer is meant for.
        pub fn tracks_time(self) -> bool {
            matches!(self, NodeType::Initiative | NodeType::Task)
        }

        pub fn as_str(self) -> &'static str {
            match self {
                NodeType::Goal => "goal",
                NodeType::Strategy => "strategy",
                NodeType::Objective => "objective",
                NodeType::KeyResult => "key_result",
                NodeType::Initiative => "initiative",
                NodeType::Task => "task",
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                NodeType::Goal => "Goal",
                NodeType::Strategy => "Strategy",
                NodeType::Objective => "Objective",
                NodeType::KeyResult => "Key Result",
                NodeType::Initiative => "Initiative",
                NodeType::Task => "Task",
            }
        }
    }

    impl fmt::Display for NodeType {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for NodeType {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
            match key.as_str() {
                "goal" => Ok(NodeType::Goal),
                "strategy" => Ok(NodeType::Strategy),
                "objective" => Ok(NodeType::Objective),
                "key_result" | "kr" => Ok(NodeType::KeyResult),
                "initiative" => Ok(NodeType::Initiative),
                "task" => Ok(NodeType::Task),
                _ => Err(DomainError::UnknownNodeType(s.to_string())),
            }
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One hierarchy item. Field names serialize in camelCase to match the snapshot format.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Node {
        pub id: NodeId,

        /// Hierarchy level; fixed at creation.
        #[serde(rename = "type")]
        pub kind: NodeType,

        #[serde(default = "untitled")]
        pub title: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,

        /// Derived cache for nodes with children, authoritative for childless nodes.
        #[serde(default, deserialize_with = "lenient_progress")]
        pub progress: u8,

        /// Display/precedence order of the children.
        #[serde(default)]
        pub children: Vec<NodeId>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub parent_id: Option<NodeId>,

        #[serde(with = "chrono::serde::ts_milliseconds", default = "unix_epoch")]
        pub created_at: DateTime<Utc>,

        /// Accumulated minutes.
        #[serde(default, deserialize_with = "lenient_minutes")]
        pub time_spent: u64,

        /// Set iff a timing session is open on this node.
        #[serde(
            default,
            with = "chrono::serde::ts_milliseconds_option",
            skip_serializing_if = "Option::is_none"
        )]
        pub timer_started_at: Option<DateTime<Utc>>,

        /// Minutes of the most recently closed session.
        #[serde(default, deserialize_with = "lenient_minutes")]
        pub last_session_time: u64,

        #[serde(default = "expanded")]
        pub is_expanded: bool,

        /// 0 = unrated; only meaningful on key results.
        #[serde(default, deserialize_with = "lenient_rating")]
        pub rating: u8,

        #[serde(
            default,
            with = "chrono::serde::ts_milliseconds_option",
            skip_serializing_if = "Option::is_none"
        )]
        pub deadline: Option<DateTime<Utc>>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub gemini_score: Option<f64>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub gemini_analysis: Option<serde_json::Value>,
    }

    impl Node {
        pub fn new(
            id: NodeId,
            kind: NodeType,
            title: String,
            parent_id: Option<NodeId>,
            created_at: DateTime<Utc>,
        ) -> Self {
            Self {
                id,
                kind,
                title,
                description: None,
                progress: 0,
                children: vec![],
                parent_id,
                created_at,
                time_spent: 0,
                timer_started_at: None,
                last_session_time: 0,
                is_expanded: true,
                rating: 0,
                deadline: None,
                gemini_score: None,
                gemini_analysis: None,
            }
        }

        pub fn is_root(&self) -> bool {
            self.parent_id.is_none()
        }

        pub fn is_running(&self) -> bool {
            self.timer_started_at.is_some()
        }

        /// Shallow-merge `patch` into the node, normalizing values on the way in.
        pub fn apply(&mut self, patch: NodePatch, placeholder: &str) -> PatchOutcome {
            let before = self.clone();
            let NodePatch {
                title,
                description,
                progress,
                rating,
                is_expanded,
                time_spent,
                last_session_time,
                deadline,
                gemini_score,
                gemini_analysis,
            } = patch;

            if let Some(title) = title {
                self.title = normalize_title(&title, placeholder);
            }
            if let Some(description) = description {
                self.description = description;
            }
            if let Some(progress) = progress {
                self.progress = progress.min(MAX_PROGRESS);
            }
            if let Some(rating) = rating {
                self.rating = rating.min(MAX_RATING);
            }
            if let Some(is_expanded) = is_expanded {
                self.is_expanded = is_expanded;
            }
            if let Some(time_spent) = time_spent {
                self.time_spent = time_spent;
            }
            if let Some(last_session_time) = last_session_time {
                self.last_session_time = last_session_time;
            }
            if let Some(deadline) = deadline {
                self.deadline = deadline;
            }
            if let Some(gemini_score) = gemini_score {
                self.gemini_score = gemini_score;
            }
            if let Some(gemini_analysis) = gemini_analysis {
                self.gemini_analysis = gemini_analysis;
            }

            PatchOutcome {
                changed: *self != before,
                progress_changed: self.progress != before.progress,
            }
        }
    }

    /* ------------------------------ Updates ------------------------------ */

    /// Per-field optional update. `None` leaves a field alone; for clearable fields
    /// `Some(None)` clears it. Structural fields (children, parent) and the timer are
    /// changed only through their dedicated store operations.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct NodePatch {
        pub title: Option<String>,
        pub description: Option<Option<String>>,
        pub progress: Option<u8>,
        pub rating: Option<u8>,
        pub is_expanded: Option<bool>,
        pub time_spent: Option<u64>,
        pub last_session_time: Option<u64>,
        pub deadline: Option<Option<DateTime<Utc>>>,
        pub gemini_score: Option<Option<f64>>,
        pub gemini_analysis: Option<Option<serde_json::Value>>,
    }

    impl NodePatch {
        pub fn with_title(mut self, title: impl Into<String>) -> Self {
            self.title = Some(title.into());
            self
        }

        pub fn with_description(mut self, description: Option<String>) -> Self {
            self.description = Some(description);
            self
        }

        pub fn with_progress(mut self, progress: u8) -> Self {
            self.progress = Some(progress);
            self
        }

        pub fn with_rating(mut self, rating: u8) -> Self {
            self.rating = Some(rating);
            self
        }

        pub fn with_time_spent(mut self, minutes: u64) -> Self {
            self.time_spent = Some(minutes);
            self
        }

        pub fn with_last_session_time(mut self, minutes: u64) -> Self {
            self.last_session_time = Some(minutes);
            self
        }

        pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
            self.deadline = Some(deadline);
            self
        }

        pub fn is_empty(&self) -> bool {
            *self == NodePatch::default()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PatchOutcome {
        pub changed: bool,
        pub progress_changed: bool,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error(
            "unknown node type {0:?} (expected goal, strategy, objective, key_result, initiative or task)"
        )]
        UnknownNodeType(String),
    }

    /* ------------------------------ Helpers ------------------------------ */

    pub const DEFAULT_TITLE: &str = "Untitled";

    pub fn normalize_title(raw: &str, placeholder: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            placeholder.to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn untitled() -> String {
        DEFAULT_TITLE.to_string()
    }

    fn expanded() -> bool {
        true
    }

    fn unix_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    // Stored documents come from other tools and older versions; numeric fields that
    // are not finite numbers decode as 0 instead of failing the whole document.
    fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let number = match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(number.filter(|x| x.is_finite()))
    }

    fn lenient_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(lenient_number(deserializer)?
            .map(|x| x.round().clamp(0.0, f64::from(MAX_PROGRESS)) as u8)
            .unwrap_or(0))
    }

    fn lenient_rating<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(lenient_number(deserializer)?
            .map(|x| x.round().clamp(0.0, f64::from(MAX_RATING)) as u8)
            .unwrap_or(0))
    }

    fn lenient_minutes<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(lenient_number(deserializer)?
            .map(|x| x.round().max(0.0) as u64)
            .unwrap_or(0))
    }

}

pub mod clock {
    //! Wall-clock source for the engine. Timestamps are kept at millisecond precision,
    //! the precision of the snapshot format.

    use chrono::{DateTime, Duration, Utc};
    use std::sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    };

    pub trait Clock {
        fn now(&self) -> DateTime<Utc>;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            truncate_millis(Utc::now())
        }
    }

    /// A clock that only moves when told to. Clones share the same instant.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        pub fn at(start: DateTime<Utc>) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
            }
        }

        pub fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
                .unwrap_or_default()
        }
    }

    pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
    }
}

pub mod progress {
    //! Progress aggregation: a parent's progress is the rounded mean of its children's.
    //!
    //! Walks are iterative and track visited ids, so depth is unbounded and a corrupted
    //! snapshot with a cycle still terminates.

    use crate::core::{NodeId, NodeMap};
    use std::collections::{HashMap, HashSet};
    use tracing::warn;

    /// Progress of `id` as derived from its subtree. Childless nodes report their stored
    /// value. Returns `None` only when `id` is not in the map.
    pub fn compute_progress(nodes: &NodeMap, id: &NodeId) -> Option<u8> {
        nodes.get(id)?;

        // Post-order over the subtree: a node is finished once all its children are.
        let mut computed: HashMap<&NodeId, u8> = HashMap::new();
        let mut on_path: HashSet<&NodeId> = HashSet::new();
        let mut stack: Vec<(&NodeId, bool)> = vec![(id, false)];

        while let Some((current, children_done)) = stack.pop() {
            let Some(node) = nodes.get(current) else {
                continue;
            };
            if children_done {
                on_path.remove(current);
                // Dangling and cyclic child ids yield no value and drop out of the mean.
                let values: Vec<u8> = node
                    .children
                    .iter()
                    .filter_map(|child| computed.get(child).copied())
                    .collect();
                let value = if values.is_empty() {
                    node.progress
                } else {
                    rounded_mean(&values)
                };
                computed.insert(current, value);
                continue;
            }
            if computed.contains_key(current) || !on_path.insert(current) {
                continue;
            }
            stack.push((current, true));
            for child in &node.children {
                if on_path.contains(child) {
                    warn!(node = %current, child = %child, "child links form a cycle; skipping");
                } else if !computed.contains_key(child) && nodes.contains_key(child) {
                    stack.push((child, false));
                }
            }
        }
        computed.get(id).copied()
    }

    /// Arithmetic mean rounded half away from zero (62.5 → 63).
    pub fn rounded_mean(values: &[u8]) -> u8 {
        if values.is_empty() {
            return 0;
        }
        let sum: u32 = values.iter().map(|&v| u32::from(v)).sum();
        (f64::from(sum) / values.len() as f64).round() as u8
    }

    /// Recompute `start` and every ancestor above it, writing results into the map.
    /// Returns how many nodes were recomputed.
    pub fn recalculate_upwards(nodes: &mut NodeMap, start: &NodeId) -> usize {
        let mut visited = HashSet::new();
        let mut touched = 0;
        let mut current = Some(start.clone());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(node = %id, "parent links form a cycle; stopping ancestor walk");
                break;
            }
            let Some(value) = compute_progress(nodes, &id) else {
                break;
            };
            let Some(node) = nodes.get_mut(&id) else {
                break;
            };
            node.progress = value;
            touched += 1;
            current = node.parent_id.clone();
        }
        touched
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{Node, NodeType};
        use chrono::Utc;

        fn insert(
            nodes: &mut NodeMap,
            id: &str,
            kind: NodeType,
            parent: Option<&str>,
            progress: u8,
        ) {
            let mut node = Node::new(
                NodeId::from(id),
                kind,
                id.to_string(),
                parent.map(NodeId::from),
                Utc::now(),
            );
            node.progress = progress;
            nodes.insert(NodeId::from(id), node);
            if let Some(p) = parent {
                nodes
                    .get_mut(&NodeId::from(p))
                    .unwrap()
                    .children
                    .push(NodeId::from(id));
            }
        }

        fn chain() -> NodeMap {
            let mut nodes = NodeMap::new();
            insert(&mut nodes, "g", NodeType::Goal, None, 0);
            insert(&mut nodes, "o", NodeType::Objective, Some("g"), 0);
            insert(&mut nodes, "k", NodeType::KeyResult, Some("o"), 0);
            insert(&mut nodes, "a", NodeType::Initiative, Some("k"), 40);
            insert(&mut nodes, "b", NodeType::Initiative, Some("k"), 0);
            nodes
        }

        #[test]
        fn mean_of_children() {
            let nodes = chain();
            assert_eq!(compute_progress(&nodes, &"k".into()), Some(20));
            assert_eq!(compute_progress(&nodes, &"g".into()), Some(20));
        }

        #[test]
        fn leaf_reports_stored_value_and_missing_is_none() {
            let nodes = chain();
            assert_eq!(compute_progress(&nodes, &"a".into()), Some(40));
            assert_eq!(compute_progress(&nodes, &"nope".into()), None);
        }

        #[test]
        fn rounds_half_away_from_zero() {
            assert_eq!(rounded_mean(&[50, 51]), 51);
            assert_eq!(rounded_mean(&[100, 25]), 63);
            assert_eq!(rounded_mean(&[0, 1, 1]), 1);
            assert_eq!(rounded_mean(&[]), 0);
        }

        #[test]
        fn propagates_to_every_ancestor() {
            let mut nodes = chain();
            nodes.get_mut(&NodeId::from("b")).unwrap().progress = 80;
            let touched = recalculate_upwards(&mut nodes, &"k".into());
            assert_eq!(touched, 3);
            for id in ["k", "o", "g"] {
                assert_eq!(nodes[&NodeId::from(id)].progress, 60, "{id}");
            }
        }

        #[test]
        fn deep_task_chains_propagate_to_the_root() {
            let mut nodes = NodeMap::new();
            insert(&mut nodes, "t0", NodeType::Goal, None, 0);
            for i in 1..=300 {
                let parent = format!("t{}", i - 1);
                insert(&mut nodes, &format!("t{i}"), NodeType::Task, Some(&parent), 0);
            }
            nodes.get_mut(&NodeId::from("t300")).unwrap().progress = 80;

            let touched = recalculate_upwards(&mut nodes, &"t299".into());
            assert_eq!(touched, 300);
            assert_eq!(nodes[&NodeId::from("t0")].progress, 80);
            assert_eq!(compute_progress(&nodes, &"t0".into()), Some(80));
        }

        #[test]
        fn dangling_children_are_filtered_out() {
            let mut nodes = chain();
            nodes
                .get_mut(&NodeId::from("k"))
                .unwrap()
                .children
                .push(NodeId::from("ghost"));
            assert_eq!(compute_progress(&nodes, &"k".into()), Some(20));

            let mut only_ghosts = NodeMap::new();
            insert(&mut only_ghosts, "p", NodeType::Objective, None, 35);
            only_ghosts
                .get_mut(&NodeId::from("p"))
                .unwrap()
                .children
                .push(NodeId::from("ghost"));
            assert_eq!(compute_progress(&only_ghosts, &"p".into()), Some(35));
        }

        #[test]
        fn cyclic_structure_terminates() {
            let mut nodes = NodeMap::new();
            insert(&mut nodes, "x", NodeType::Task, None, 10);
            insert(&mut nodes, "y", NodeType::Task, Some("x"), 30);
            // Corrupt: y -> x -> y
            nodes.get_mut(&NodeId::from("y")).unwrap().children.push("x".into());
            nodes.get_mut(&NodeId::from("x")).unwrap().parent_id = Some("y".into());

            assert_eq!(compute_progress(&nodes, &"x".into()), Some(30));
            assert_eq!(recalculate_upwards(&mut nodes, &"x".into()), 2);
        }
    }
}

pub mod timer {
    //! The single global timer. Elapsed time is derived from wall-clock reads on demand;
    //! nothing ticks in the background.

    use crate::core::{Node, NodeId, NodeMap};
    use chrono::{DateTime, Utc};

    pub const MILLIS_PER_MINUTE: i64 = 60_000;

    /// The running node, if any. With a consistent store there is at most one.
    pub fn active(nodes: &NodeMap) -> Option<&Node> {
        nodes.values().find(|n| n.is_running())
    }

    pub fn running_ids(nodes: &NodeMap) -> Vec<NodeId> {
        nodes
            .values()
            .filter(|n| n.is_running())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Start timing `id`. Any other running session is closed without crediting its
    /// elapsed time; the ids of those interrupted nodes are returned. `None` when `id`
    /// does not exist.
    pub fn start(nodes: &mut NodeMap, id: &NodeId, now: DateTime<Utc>) -> Option<Vec<NodeId>> {
        if !nodes.contains_key(id) {
            return None;
        }
        let mut interrupted = Vec::new();
        for node in nodes.values_mut() {
            if &node.id != id && node.timer_started_at.take().is_some() {
                interrupted.push(node.id.clone());
            }
        }
        if let Some(node) = nodes.get_mut(id) {
            node.timer_started_at = Some(now);
        }
        Some(interrupted)
    }

    /// Close the session on `id` without any accounting. Returns when it had started,
    /// or `None` if the node is missing or was not running.
    pub fn stop(nodes: &mut NodeMap, id: &NodeId) -> Option<DateTime<Utc>> {
        nodes.get_mut(id)?.timer_started_at.take()
    }

    /// Whole minutes between `started` and `now`; never negative.
    pub fn elapsed_minutes(started: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        let millis = (now - started).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis / MILLIS_PER_MINUTE) as u64
        }
    }

}

pub mod snapshot {
    //! Persisted and exported documents, and the import contract.
    //!
    //! The working file carries `{nodes, rootIds}`; export files add `version` and
    //! `exportedAt`. Import accepts either, as long as both `nodes` and `rootIds` are present.

    use crate::core::{NodeId, NodeMap};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    pub const EXPORT_VERSION: u32 = 1;

    /// The committed state of the store.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WorkingState {
        pub nodes: NodeMap,
        pub root_ids: Vec<NodeId>,
    }

    impl WorkingState {
        pub fn is_empty(&self) -> bool {
            self.nodes.is_empty() && self.root_ids.is_empty()
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ExportDocument {
        #[serde(flatten)]
        pub state: WorkingState,
        pub version: u32,
        pub exported_at: DateTime<Utc>,
    }

    impl ExportDocument {
        pub fn new(state: WorkingState, exported_at: DateTime<Utc>) -> Self {
            Self {
                state,
                version: EXPORT_VERSION,
                exported_at,
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ImportError {
        #[error("import document is not valid JSON: {0}")]
        Syntax(#[source] serde_json::Error),
        #[error("import document is not a JSON object")]
        NotAnObject,
        #[error("import document is missing `{0}`")]
        MissingField(&'static str),
        #[error("import document has a malformed `{field}` section: {source}")]
        Malformed {
            field: &'static str,
            #[source]
            source: serde_json::Error,
        },
    }

    /// Decode a candidate document into a working state without touching any store.
    pub fn parse_import(value: serde_json::Value) -> Result<WorkingState, ImportError> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(ImportError::NotAnObject);
        };
        let nodes = take_present(&mut map, "nodes")?;
        let root_ids = take_present(&mut map, "rootIds")?;

        let nodes: NodeMap = serde_json::from_value(nodes).map_err(|source| {
            ImportError::Malformed {
                field: "nodes",
                source,
            }
        })?;
        let root_ids: Vec<NodeId> = serde_json::from_value(root_ids).map_err(|source| {
            ImportError::Malformed {
                field: "rootIds",
                source,
            }
        })?;
        Ok(WorkingState { nodes, root_ids })
    }

    pub fn parse_import_str(text: &str) -> Result<WorkingState, ImportError> {
        let value = serde_json::from_str(text).map_err(ImportError::Syntax)?;
        parse_import(value)
    }

    fn take_present(
        map: &mut serde_json::Map<String, serde_json::Value>,
        field: &'static str,
    ) -> Result<serde_json::Value, ImportError> {
        map.remove(field)
            .filter(|v| !v.is_null())
            .ok_or(ImportError::MissingField(field))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn rejects_documents_without_both_sections() {
            assert!(matches!(
                parse_import(json!({})),
                Err(ImportError::MissingField("nodes"))
            ));
            assert!(matches!(
                parse_import(json!({"nodes": {}})),
                Err(ImportError::MissingField("rootIds"))
            ));
            assert!(matches!(
                parse_import(json!({"nodes": {}, "rootIds": null})),
                Err(ImportError::MissingField("rootIds"))
            ));
            assert!(matches!(
                parse_import(json!([1, 2])),
                Err(ImportError::NotAnObject)
            ));
            assert!(matches!(
                parse_import_str("{nodes"),
                Err(ImportError::Syntax(_))
            ));
            assert!(matches!(
                parse_import(json!({"nodes": [], "rootIds": []})),
                Err(ImportError::Malformed { field: "nodes", .. })
            ));
        }

        #[test]
        fn export_document_layout() {
            let exported_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
            let doc = ExportDocument::new(WorkingState::default(), exported_at);
            let value = serde_json::to_value(&doc).unwrap();
            assert_eq!(
                value,
                json!({
                    "nodes": {},
                    "rootIds": [],
                    "version": 1,
                    "exportedAt": "2023-11-14T22:13:20Z"
                })
            );
            let back = parse_import(value).unwrap();
            assert!(back.is_empty());
        }
    }
}

pub mod config {
    //! `okr.toml`. Every field has a default, and a missing file means "all defaults".
    //!
    //! ```toml
    //! [storage]
    //! data_file = "okr_data.json"
    //!
    //! [engine]
    //! default_title = "Untitled"
    //! recalculate_on_structure_change = false
    //!
    //! [log]
    //! filter = "warn"
    //! ```

    use crate::core::DEFAULT_TITLE;
    use serde::{Deserialize, Serialize};
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };

    pub const CONFIG_FILE_NAME: &str = "okr.toml";

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        pub storage: StorageConfig,
        pub engine: EngineConfig,
        pub log: LogConfig,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct StorageConfig {
        /// Working-state JSON document.
        pub data_file: PathBuf,
    }

    impl Default for StorageConfig {
        fn default() -> Self {
            Self {
                data_file: PathBuf::from("okr_data.json"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct EngineConfig {
        /// Title used when a node is created or renamed with an empty title.
        pub default_title: String,
        /// Recompute former/new parents after delete and move. Off by default: only
        /// progress edits propagate upward.
        pub recalculate_on_structure_change: bool,
    }

    impl Default for EngineConfig {
        fn default() -> Self {
            Self {
                default_title: DEFAULT_TITLE.to_string(),
                recalculate_on_structure_change: false,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct LogConfig {
        /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
        pub filter: String,
    }

    impl Default for LogConfig {
        fn default() -> Self {
            Self {
                filter: "warn".to_string(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read config {}: {source}", path.display())]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to parse config {}: {source}", path.display())]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }

    impl Config {
        /// Load from `path`; a missing file yields the defaults.
        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            if !path.exists() {
                return Ok(Config::default());
            }
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_file_gives_defaults() {
            let dir = tempfile::tempdir().expect("tempdir");
            let config = Config::load(&dir.path().join(CONFIG_FILE_NAME)).expect("load");
            assert_eq!(config, Config::default());
            assert_eq!(config.engine.default_title, DEFAULT_TITLE);
            assert!(!config.engine.recalculate_on_structure_change);
        }

        #[test]
        fn partial_tables_keep_remaining_defaults() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join(CONFIG_FILE_NAME);
            fs::write(
                &path,
                "[engine]\nrecalculate_on_structure_change = true\n\n[log]\nfilter = \"okr=debug\"\n",
            )
            .expect("write");
            let config = Config::load(&path).expect("load");
            assert!(config.engine.recalculate_on_structure_change);
            assert_eq!(config.engine.default_title, DEFAULT_TITLE);
            assert_eq!(config.log.filter, "okr=debug");
            assert_eq!(config.storage, StorageConfig::default());
        }

        #[test]
        fn parse_errors_name_the_file() {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join(CONFIG_FILE_NAME);
            fs::write(&path, "[engine\n").expect("write");
            let err = Config::load(&path).unwrap_err();
            assert!(matches!(err, ConfigError::Parse { .. }));
            assert!(err.to_string().contains(CONFIG_FILE_NAME));
        }
    }
}

pub mod store {
    //! The Tree Store: sole owner and mutator of the node map and root ordering.
    //!
    //! Every operation runs to completion synchronously. Operations that reference an id
    //! that does not exist are silent no-ops. After each committed mutation the
    //! subscribed listeners see the event and the new snapshot; no-ops notify nobody.

    use crate::clock::{Clock, SystemClock};
    use crate::config::EngineConfig;
    use crate::core::{Node, NodeId, NodeMap, NodePatch, NodeType};
    use crate::progress;
    use crate::snapshot::{self, ExportDocument, ImportError, WorkingState};
    use crate::timer;
    use std::collections::HashSet;
    use std::fmt;
    use tracing::{debug, info, warn};

    /* ------------------------------ Events ------------------------------ */

    #[derive(Debug, Clone, PartialEq)]
    pub enum StoreEvent {
        NodeAdded {
            id: NodeId,
            parent_id: Option<NodeId>,
        },
        NodeUpdated {
            id: NodeId,
            progress_changed: bool,
        },
        ProgressRecalculated {
            start: NodeId,
        },
        SubtreeDeleted {
            id: NodeId,
            removed: Vec<NodeId>,
        },
        NodeMoved {
            id: NodeId,
            parent_id: Option<NodeId>,
            index: usize,
        },
        ExpandToggled {
            id: NodeId,
            expanded: bool,
        },
        TimerStarted {
            id: NodeId,
            /// Nodes whose running sessions were discarded by this start.
            interrupted: Vec<NodeId>,
        },
        TimerStopped {
            id: NodeId,
        },
        SessionLogged {
            id: NodeId,
            entry: NodeId,
            minutes: u64,
        },
        Imported {
            nodes: usize,
        },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubscriptionId(u64);

    type Listener = Box<dyn FnMut(&StoreEvent, &WorkingState)>;

    /* --------------------------- Invariant checks --------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvariantViolation {
        #[error("node stored under key {key} carries id {id}")]
        KeyMismatch { key: NodeId, id: NodeId },
        #[error("node {id} points at missing parent {parent}")]
        MissingParent { id: NodeId, parent: NodeId },
        #[error("node {id} is not listed among the children of its parent {parent}")]
        NotListedByParent { id: NodeId, parent: NodeId },
        #[error("root {id} is not listed in rootIds")]
        RootNotListed { id: NodeId },
        #[error("rootIds entry {id} is missing or has a parent")]
        InvalidRootEntry { id: NodeId },
        #[error("{id} appears more than once in rootIds")]
        DuplicateRoot { id: NodeId },
        #[error("{parent} lists missing child {child}")]
        DanglingChild { parent: NodeId, child: NodeId },
        #[error("{parent} lists {child}, whose parent is elsewhere")]
        ForeignChild { parent: NodeId, child: NodeId },
        #[error("{parent} lists child {child} more than once")]
        DuplicateChild { parent: NodeId, child: NodeId },
        #[error("{id} is reachable more than once from the roots")]
        VisitedTwice { id: NodeId },
        #[error("{id} is not reachable from any root")]
        Unreachable { id: NodeId },
        #[error("more than one timer is running: {running:?}")]
        MultipleTimers { running: Vec<NodeId> },
    }

    /* ------------------------------ The store ------------------------------ */

    pub struct TreeStore {
        state: WorkingState,
        config: EngineConfig,
        clock: Box<dyn Clock>,
        listeners: Vec<(SubscriptionId, Listener)>,
        next_subscription: u64,
    }

    impl fmt::Debug for TreeStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TreeStore")
                .field("state", &self.state)
                .field("config", &self.config)
                .field("listeners", &self.listeners.len())
                .finish()
        }
    }

    impl Default for TreeStore {
        fn default() -> Self {
            Self::new(EngineConfig::default(), SystemClock)
        }
    }

    impl TreeStore {
        pub fn new(config: EngineConfig, clock: impl Clock + 'static) -> Self {
            Self::from_state(WorkingState::default(), config, clock)
        }

        /// Start from a previously persisted snapshot (the load-on-start call).
        pub fn from_state(
            state: WorkingState,
            config: EngineConfig,
            clock: impl Clock + 'static,
        ) -> Self {
            Self {
                state,
                config,
                clock: Box::new(clock),
                listeners: Vec::new(),
                next_subscription: 0,
            }
        }

        /* ------------------------------ Reads ------------------------------ */

        /// The committed snapshot. Consumers read it; only the store mutates it.
        pub fn snapshot(&self) -> &WorkingState {
            &self.state
        }

        pub fn node(&self, id: &NodeId) -> Option<&Node> {
            self.state.nodes.get(id)
        }

        pub fn roots(&self) -> Vec<&Node> {
            self.state
                .root_ids
                .iter()
                .filter_map(|id| self.state.nodes.get(id))
                .collect()
        }

        pub fn children_of(&self, id: &NodeId) -> Vec<&Node> {
            self.state
                .nodes
                .get(id)
                .map(|n| {
                    n.children
                        .iter()
                        .filter_map(|c| self.state.nodes.get(c))
                        .collect()
                })
                .unwrap_or_default()
        }

        /// Breadcrumb path from the root down to `id`'s parent.
        pub fn ancestors(&self, id: &NodeId) -> Vec<&Node> {
            let mut path = Vec::new();
            let mut seen = HashSet::from([id]);
            let mut current = self.state.nodes.get(id).and_then(|n| n.parent_id.as_ref());
            while let Some(parent_id) = current {
                if !seen.insert(parent_id) {
                    break;
                }
                let Some(parent) = self.state.nodes.get(parent_id) else {
                    break;
                };
                path.push(parent);
                current = parent.parent_id.as_ref();
            }
            path.reverse();
            path
        }

        /// Minutes logged anywhere in the subtree rooted at `id`.
        pub fn total_time(&self, id: &NodeId) -> u64 {
            let mut total = 0;
            let mut seen = HashSet::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if !seen.insert(current) {
                    continue;
                }
                if let Some(node) = self.state.nodes.get(current) {
                    total += node.time_spent;
                    stack.extend(node.children.iter());
                }
            }
            total
        }

        /* ------------------------- Notifications ------------------------- */

        pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
        where
            F: FnMut(&StoreEvent, &WorkingState) + 'static,
        {
            let id = SubscriptionId(self.next_subscription);
            self.next_subscription += 1;
            self.listeners.push((id, Box::new(listener)));
            id
        }

        pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
            let before = self.listeners.len();
            self.listeners.retain(|(sid, _)| *sid != id);
            self.listeners.len() != before
        }

        fn commit(&mut self, event: StoreEvent) {
            for (_, listener) in self.listeners.iter_mut() {
                listener(&event, &self.state);
            }
        }

        /* --------------------------- Mutations --------------------------- */

        /// Create a node under `parent_id` (or as a root when absent or unresolvable).
        /// `fields` override the defaults; a fresh node does not trigger aggregation.
        pub fn add_node(
            &mut self,
            parent_id: Option<&NodeId>,
            kind: NodeType,
            fields: NodePatch,
        ) -> NodeId {
            let (id, parent) = self.insert_node(parent_id, kind, fields);
            info!(node = %id, kind = kind.as_str(), parent = ?parent, "node added");
            self.commit(StoreEvent::NodeAdded {
                id: id.clone(),
                parent_id: parent,
            });
            id
        }

        /// Build and link a node without notifying; returns its id and resolved parent.
        fn insert_node(
            &mut self,
            parent_id: Option<&NodeId>,
            kind: NodeType,
            fields: NodePatch,
        ) -> (NodeId, Option<NodeId>) {
            let now = self.clock.now();
            let id = self.fresh_id(now);

            let parent = parent_id
                .filter(|p| self.state.nodes.contains_key(*p))
                .cloned();
            if let (Some(requested), None) = (parent_id, &parent) {
                debug!(parent = %requested, "parent not found; creating node as a root");
            }

            let mut node = Node::new(
                id.clone(),
                kind,
                self.config.default_title.clone(),
                parent.clone(),
                now,
            );
            node.apply(fields, &self.config.default_title);
            self.state.nodes.insert(id.clone(), node);

            match parent.as_ref().and_then(|p| self.state.nodes.get_mut(p)) {
                Some(parent_node) => parent_node.children.push(id.clone()),
                None => self.state.root_ids.push(id.clone()),
            }
            (id, parent)
        }

        fn fresh_id(&self, now: chrono::DateTime<chrono::Utc>) -> NodeId {
            loop {
                let id = NodeId::generate(now);
                if !self.state.nodes.contains_key(&id) {
                    return id;
                }
            }
        }

        /// Merge `patch` into the node. A progress change recomputes the ancestors,
        /// starting at the node's parent.
        pub fn update_node(&mut self, id: &NodeId, patch: NodePatch) -> &WorkingState {
            let Some(node) = self.state.nodes.get_mut(id) else {
                debug!(node = %id, "update of unknown node ignored");
                return &self.state;
            };
            let outcome = node.apply(patch, &self.config.default_title);
            let parent = node.parent_id.clone();
            if !outcome.changed {
                return &self.state;
            }

            if outcome.progress_changed {
                if let Some(parent) = &parent {
                    progress::recalculate_upwards(&mut self.state.nodes, parent);
                }
            }

            debug!(node = %id, progress_changed = outcome.progress_changed, "node updated");
            self.commit(StoreEvent::NodeUpdated {
                id: id.clone(),
                progress_changed: outcome.progress_changed,
            });
            &self.state
        }

        /// Remove the node and its whole subtree, children before parents.
        pub fn delete_node(&mut self, id: &NodeId) -> &WorkingState {
            let Some(parent_id) = self.state.nodes.get(id).map(|n| n.parent_id.clone()) else {
                debug!(node = %id, "delete of unknown node ignored");
                return &self.state;
            };

            // Collect the whole subtree first, then drop it in one pass.
            let mut removed = self.collect_subtree(id);
            removed.reverse();
            let doomed: HashSet<&NodeId> = removed.iter().collect();
            self.state.nodes.retain(|key, _| !doomed.contains(key));

            if let Some(parent) = parent_id.as_ref().and_then(|p| self.state.nodes.get_mut(p)) {
                parent.children.retain(|c| c != id);
            }
            self.state.root_ids.retain(|r| r != id);

            if self.config.recalculate_on_structure_change {
                if let Some(parent) = &parent_id {
                    progress::recalculate_upwards(&mut self.state.nodes, parent);
                }
            }

            info!(node = %id, removed = removed.len(), "subtree deleted");
            self.commit(StoreEvent::SubtreeDeleted {
                id: id.clone(),
                removed,
            });
            &self.state
        }

        /// `id` and every existing node below it, parents before children. Each id
        /// appears once, even when corrupted child links form a cycle.
        fn collect_subtree(&self, id: &NodeId) -> Vec<NodeId> {
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            let mut stack = vec![id.clone()];
            while let Some(current) = stack.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                let Some(node) = self.state.nodes.get(&current) else {
                    continue;
                };
                stack.extend(node.children.iter().rev().cloned());
                order.push(current);
            }
            order
        }

        /// Reparent `id` under `new_parent_id` (or to the root level) at `new_index`,
        /// clamped to the destination length. Moves that would put a node inside its
        /// own subtree are ignored.
        pub fn move_node(
            &mut self,
            id: &NodeId,
            new_parent_id: Option<&NodeId>,
            new_index: usize,
        ) -> &WorkingState {
            let Some(old_parent) = self.state.nodes.get(id).map(|n| n.parent_id.clone()) else {
                debug!(node = %id, "move of unknown node ignored");
                return &self.state;
            };
            if let Some(target) = new_parent_id {
                if !self.state.nodes.contains_key(target) {
                    debug!(node = %id, parent = %target, "move to unknown parent ignored");
                    return &self.state;
                }
                if self.is_within_subtree(target, id) {
                    warn!(node = %id, parent = %target, "move into own subtree ignored");
                    return &self.state;
                }
            }

            if let Some(parent) = old_parent.as_ref().and_then(|p| self.state.nodes.get_mut(p)) {
                parent.children.retain(|c| c != id);
            }
            self.state.root_ids.retain(|r| r != id);

            if let Some(node) = self.state.nodes.get_mut(id) {
                node.parent_id = new_parent_id.cloned();
            }

            let container = match new_parent_id.and_then(|p| self.state.nodes.get_mut(p)) {
                Some(parent) => &mut parent.children,
                None => &mut self.state.root_ids,
            };
            let index = new_index.min(container.len());
            container.insert(index, id.clone());

            if self.config.recalculate_on_structure_change {
                for parent in [old_parent.as_ref(), new_parent_id].into_iter().flatten() {
                    progress::recalculate_upwards(&mut self.state.nodes, parent);
                }
            }

            info!(node = %id, parent = ?new_parent_id, index, "node moved");
            self.commit(StoreEvent::NodeMoved {
                id: id.clone(),
                parent_id: new_parent_id.cloned(),
                index,
            });
            &self.state
        }

        /// Whether `candidate` is `ancestor` itself or lies below it. Walks parent links;
        /// a cycle in them counts as "within".
        fn is_within_subtree(&self, candidate: &NodeId, ancestor: &NodeId) -> bool {
            let mut seen = HashSet::new();
            let mut current = Some(candidate);
            while let Some(id) = current {
                if id == ancestor || !seen.insert(id) {
                    return true;
                }
                current = self.state.nodes.get(id).and_then(|n| n.parent_id.as_ref());
            }
            false
        }

        /// Flip the persisted collapse state. No other effect.
        pub fn toggle_expand(&mut self, id: &NodeId) -> &WorkingState {
            let Some(node) = self.state.nodes.get_mut(id) else {
                return &self.state;
            };
            node.is_expanded = !node.is_expanded;
            let expanded = node.is_expanded;
            self.commit(StoreEvent::ExpandToggled {
                id: id.clone(),
                expanded,
            });
            &self.state
        }

        /* --------------------------- Aggregation --------------------------- */

        pub fn compute_progress(&self, id: &NodeId) -> Option<u8> {
            progress::compute_progress(&self.state.nodes, id)
        }

        pub fn recalculate_upwards(&mut self, start: &NodeId) -> &WorkingState {
            if !self.state.nodes.contains_key(start) {
                return &self.state;
            }
            progress::recalculate_upwards(&mut self.state.nodes, start);
            self.commit(StoreEvent::ProgressRecalculated {
                start: start.clone(),
            });
            &self.state
        }

        /* ------------------------------ Timer ------------------------------ */

        /// Start timing `id`. A session running elsewhere is closed and its elapsed time
        /// is discarded, not credited.
        pub fn start_timer(&mut self, id: &NodeId) -> &WorkingState {
            let now = self.clock.now();
            let Some(interrupted) = timer::start(&mut self.state.nodes, id, now) else {
                debug!(node = %id, "timer start on unknown node ignored");
                return &self.state;
            };
            for other in &interrupted {
                info!(node = %other, "running session discarded by timer switch");
            }
            info!(node = %id, "timer started");
            self.commit(StoreEvent::TimerStarted {
                id: id.clone(),
                interrupted,
            });
            &self.state
        }

        /// Low-level stop: clears the running mark without crediting any time.
        pub fn stop_timer(&mut self, id: &NodeId) -> &WorkingState {
            if timer::stop(&mut self.state.nodes, id).is_none() {
                debug!(node = %id, "timer stop on idle or unknown node ignored");
                return &self.state;
            }
            info!(node = %id, "timer stopped");
            self.commit(StoreEvent::TimerStopped { id: id.clone() });
            &self.state
        }

        /// Close the running session on `id` and throw the elapsed time away.
        pub fn abandon_session(&mut self, id: &NodeId) -> &WorkingState {
            self.stop_timer(id)
        }

        pub fn active_timer(&self) -> Option<&Node> {
            timer::active(&self.state.nodes)
        }

        /// Whole minutes of the session running on `id`, if one is.
        pub fn elapsed_minutes(&self, id: &NodeId) -> Option<u64> {
            let started = self.state.nodes.get(id)?.timer_started_at?;
            Some(timer::elapsed_minutes(started, self.clock.now()))
        }

        /// Close the running session on `id` and record it as a child Task titled
        /// `summary` carrying the elapsed minutes. Stopping and recording commit together
        /// as one `SessionLogged`. Returns the new task's id, or `None` when `id` is
        /// unknown or not running.
        pub fn log_session(&mut self, id: &NodeId, summary: &str) -> Option<NodeId> {
            let minutes = self.elapsed_minutes(id)?;
            timer::stop(&mut self.state.nodes, id);
            Some(self.record_time(id, minutes, summary))
        }

        /// Record `minutes` of work done without the timer, as a child Task of `id`.
        pub fn log_manual_time(&mut self, id: &NodeId, minutes: u64, note: &str) -> Option<NodeId> {
            if !self.state.nodes.contains_key(id) {
                debug!(node = %id, "manual time entry on unknown node ignored");
                return None;
            }
            Some(self.record_time(id, minutes, note))
        }

        fn record_time(&mut self, id: &NodeId, minutes: u64, summary: &str) -> NodeId {
            let (entry, _) = self.insert_node(
                Some(id),
                NodeType::Task,
                NodePatch::default()
                    .with_title(summary)
                    .with_time_spent(minutes)
                    .with_last_session_time(minutes),
            );
            info!(node = %id, entry = %entry, minutes, "session logged");
            self.commit(StoreEvent::SessionLogged {
                id: id.clone(),
                entry: entry.clone(),
                minutes,
            });
            entry
        }

        /// Session-termination hook: stop whatever is running, without logging it.
        pub fn shutdown(&mut self) -> &WorkingState {
            match self.active_timer().map(|n| n.id.clone()) {
                Some(id) => self.stop_timer(&id),
                None => &self.state,
            }
        }

        /* ------------------------- Export / import ------------------------- */

        pub fn export(&self) -> ExportDocument {
            ExportDocument::new(self.state.clone(), self.clock.now())
        }

        /// Replace the whole store with `document` if it carries both `nodes` and
        /// `rootIds`. On rejection nothing changes.
        pub fn import_document(
            &mut self,
            document: serde_json::Value,
        ) -> Result<&WorkingState, ImportError> {
            let state = snapshot::parse_import(document)?;
            Ok(self.replace_state(state))
        }

        pub fn import_str(&mut self, text: &str) -> Result<&WorkingState, ImportError> {
            let state = snapshot::parse_import_str(text)?;
            Ok(self.replace_state(state))
        }

        fn replace_state(&mut self, mut state: WorkingState) -> &WorkingState {
            keep_latest_timer(&mut state.nodes);
            self.state = state;
            for violation in self.check_invariants() {
                warn!(%violation, "imported document is inconsistent");
            }
            let nodes = self.state.nodes.len();
            info!(nodes, "store replaced by import");
            self.commit(StoreEvent::Imported { nodes });
            &self.state
        }

        /* --------------------------- Consistency --------------------------- */

        /// Every violation of the structural and timer invariants; empty when consistent.
        pub fn check_invariants(&self) -> Vec<InvariantViolation> {
            check_invariants(&self.state)
        }
    }

    /// Imported documents may carry several open sessions; keep the most recent one.
    fn keep_latest_timer(nodes: &mut NodeMap) {
        let latest = nodes
            .values()
            .filter_map(|n| n.timer_started_at.map(|t| (t, n.id.clone())))
            .max_by_key(|(t, _)| *t)
            .map(|(_, id)| id);
        for node in nodes.values_mut() {
            if Some(&node.id) != latest.as_ref() && node.timer_started_at.take().is_some() {
                warn!(node = %node.id, "dropping extra running timer from import");
            }
        }
    }

    pub fn check_invariants(state: &WorkingState) -> Vec<InvariantViolation> {
        use InvariantViolation::*;

        let nodes = &state.nodes;
        let mut out = Vec::new();

        for (key, node) in nodes {
            if key != &node.id {
                out.push(KeyMismatch {
                    key: key.clone(),
                    id: node.id.clone(),
                });
            }
            match &node.parent_id {
                Some(parent) => match nodes.get(parent) {
                    None => out.push(MissingParent {
                        id: key.clone(),
                        parent: parent.clone(),
                    }),
                    Some(p) if !p.children.contains(key) => out.push(NotListedByParent {
                        id: key.clone(),
                        parent: parent.clone(),
                    }),
                    Some(_) => {}
                },
                None if !state.root_ids.contains(key) => {
                    out.push(RootNotListed { id: key.clone() })
                }
                None => {}
            }

            let mut seen = HashSet::new();
            for child in &node.children {
                if !seen.insert(child) {
                    out.push(DuplicateChild {
                        parent: key.clone(),
                        child: child.clone(),
                    });
                    continue;
                }
                match nodes.get(child) {
                    None => out.push(DanglingChild {
                        parent: key.clone(),
                        child: child.clone(),
                    }),
                    Some(c) if c.parent_id.as_ref() != Some(key) => out.push(ForeignChild {
                        parent: key.clone(),
                        child: child.clone(),
                    }),
                    Some(_) => {}
                }
            }
        }

        let mut seen_roots = HashSet::new();
        for root in &state.root_ids {
            if !seen_roots.insert(root) {
                out.push(DuplicateRoot { id: root.clone() });
            } else if nodes.get(root).is_none_or(|n| !n.is_root()) {
                out.push(InvalidRootEntry { id: root.clone() });
            }
        }

        // Reachability: every node exactly once from the roots.
        let mut visited = HashSet::new();
        let mut stack: Vec<&NodeId> = seen_roots.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                out.push(VisitedTwice { id: id.clone() });
                continue;
            }
            if let Some(node) = nodes.get(id) {
                let mut unique = HashSet::new();
                stack.extend(node.children.iter().filter(|c| unique.insert(*c)));
            }
        }
        for key in nodes.keys() {
            if !visited.contains(key) {
                out.push(Unreachable { id: key.clone() });
            }
        }

        let running = timer::running_ids(nodes);
        if running.len() > 1 {
            out.push(MultipleTimers { running });
        }
        out
    }

}

pub mod storage {
    //! Persistence collaborator. The store never touches disk itself; the binary loads
    //! a snapshot at start and saves after each committed mutation.

    use crate::snapshot::WorkingState;
    use anyhow::{Context, Result};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tracing::debug;

    pub trait SnapshotRepository {
        /// The last saved snapshot, or an empty state when nothing has been stored yet.
        fn load(&self) -> Result<WorkingState>;

        fn save(&self, state: &WorkingState) -> Result<()>;
    }

    /// `{nodes, rootIds}` as pretty-printed JSON in a single local file.
    #[derive(Debug, Clone)]
    pub struct JsonFileRepository {
        path: PathBuf,
    }

    impl JsonFileRepository {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SnapshotRepository for JsonFileRepository {
        fn load(&self) -> Result<WorkingState> {
            if !self.path.exists() {
                debug!(path = %self.path.display(), "no data file yet; starting empty");
                return Ok(WorkingState::default());
            }
            let text = fs::read_to_string(&self.path)
                .with_context(|| format!("reading {}", self.path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("decoding {}", self.path.display()))
        }

        fn save(&self, state: &WorkingState) -> Result<()> {
            let json = serde_json::to_string_pretty(state).context("encoding working state")?;
            write_atomic(&self.path, json.as_bytes())?;
            debug!(path = %self.path.display(), nodes = state.nodes.len(), "saved");
            Ok(())
        }
    }

    /// Write through a sibling temp file and rename over the target.
    pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, bytes).with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, path)
            .with_context(|| format!("replacing {} with {}", path.display(), temp.display()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{Node, NodeId, NodeType};
        use chrono::{TimeZone, Utc};

        fn sample() -> WorkingState {
            let mut state = WorkingState::default();
            let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let id = NodeId::from("1735689600000-0badf00d");
            state.nodes.insert(
                id.clone(),
                Node::new(id.clone(), NodeType::Goal, "Ship".into(), None, created),
            );
            state.root_ids.push(id);
            state
        }

        #[test]
        fn missing_file_loads_empty() {
            let dir = tempfile::tempdir().unwrap();
            let repo = JsonFileRepository::new(dir.path().join("okr_data.json"));
            assert!(repo.load().unwrap().is_empty());
        }

        #[test]
        fn save_then_load() {
            let dir = tempfile::tempdir().unwrap();
            let repo = JsonFileRepository::new(dir.path().join("nested/okr_data.json"));
            let state = sample();
            repo.save(&state).unwrap();
            assert_eq!(repo.load().unwrap(), state);
            assert!(!dir.path().join("nested/okr_data.json.tmp").exists());

            let raw = fs::read_to_string(repo.path()).unwrap();
            assert!(raw.contains("\"rootIds\""));
            assert!(raw.contains("\"createdAt\": 1735689600000"));
        }

        #[test]
        fn corrupt_file_is_an_error() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("okr_data.json");
            fs::write(&path, "{ not json").unwrap();
            let err = JsonFileRepository::new(&path).load().unwrap_err();
            assert!(format!("{err:#}").contains("decoding"));
        }
    }
}

pub mod report {
    //! Read-only projections of a snapshot: the outline view, duration formatting and
    //! deadline health.

    use crate::core::{Node, NodeId, NodeType};
    use crate::snapshot::WorkingState;
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;
    use std::fmt::Write as _;

    const MILLIS_PER_DAY: f64 = 86_400_000.0;

    /* ------------------------------ Outline ------------------------------ */

    /// Outline of every root and its expanded descendants.
    ///
    /// ```text
    /// Get fit [Goal] 60%
    /// └── Run [Objective] 60%
    ///     └── 10k [Key Result] 60% ★3
    ///         ├── Plan [Initiative] 40% · 1h 5m
    ///         └── Train [Initiative] 80% ▶
    /// ```
    ///
    /// Collapsed nodes show a `+` and hide their children.
    pub fn render_tree(state: &WorkingState) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        for id in &state.root_ids {
            if let Some(node) = state.nodes.get(id) {
                push_line(&mut out, "", node);
                render_children(&mut out, state, node, "", &mut seen);
            }
        }
        out
    }

    fn render_children<'a>(
        out: &mut String,
        state: &'a WorkingState,
        node: &'a Node,
        prefix: &str,
        seen: &mut HashSet<&'a NodeId>,
    ) {
        if !seen.insert(&node.id) || !node.is_expanded {
            return;
        }
        let children: Vec<&Node> = node
            .children
            .iter()
            .filter_map(|c| state.nodes.get(c))
            .collect();
        for (i, child) in children.iter().enumerate() {
            let is_last = i + 1 == children.len();
            let branch = if is_last { "└── " } else { "├── " };
            push_line(out, &format!("{prefix}{branch}"), child);
            let continuation = if is_last { "    " } else { "│   " };
            render_children(out, state, child, &format!("{prefix}{continuation}"), seen);
        }
    }

    fn push_line(out: &mut String, lead: &str, node: &Node) {
        let _ = write!(out, "{lead}{} [{}] {}%", node.title, node.kind.label(), node.progress);
        if node.kind == NodeType::KeyResult && node.rating > 0 {
            let _ = write!(out, " ★{}", node.rating);
        }
        if node.time_spent > 0 {
            let _ = write!(out, " · {}", format_minutes(node.time_spent));
        }
        if node.is_running() {
            out.push_str(" ▶");
        }
        if !node.is_expanded && !node.children.is_empty() {
            out.push_str(" +");
        }
        out.push('\n');
    }

    /* ------------------------------ Durations ------------------------------ */

    /// `45m`, `1h 5m`.
    pub fn format_minutes(total: u64) -> String {
        if total < 60 {
            format!("{total}m")
        } else {
            format!("{}h {}m", total / 60, total % 60)
        }
    }

    /// `HH:MM:SS`; hours are not wrapped at 24.
    pub fn format_elapsed(seconds: u64) -> String {
        format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }

    /* ------------------------------ Deadlines ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum DeadlineStatus {
        Completed,
        NoDeadline,
        Overdue,
        OnTrack,
        AtRisk,
    }

    impl DeadlineStatus {
        pub fn label(self) -> &'static str {
            match self {
                DeadlineStatus::Completed => "Completed",
                DeadlineStatus::NoDeadline => "No Deadline",
                DeadlineStatus::Overdue => "Overdue",
                DeadlineStatus::OnTrack => "On Track",
                DeadlineStatus::AtRisk => "At Risk",
            }
        }
    }

    /// Status plus a 0–100 health score (100 = healthy).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeadlineHealth {
        pub status: DeadlineStatus,
        pub health: u8,
    }

    pub fn deadline_status(node: &Node, now: DateTime<Utc>) -> DeadlineHealth {
        let progress = f64::from(node.progress);
        let health = |status, score: f64| DeadlineHealth {
            status,
            health: score.clamp(0.0, 100.0) as u8,
        };

        if node.progress >= 100 {
            return health(DeadlineStatus::Completed, 100.0);
        }
        let Some(deadline) = node.deadline else {
            return health(DeadlineStatus::NoDeadline, 50.0);
        };

        if now > deadline {
            let days_overdue = (now - deadline).num_milliseconds() as f64 / MILLIS_PER_DAY;
            return health(
                DeadlineStatus::Overdue,
                (progress - days_overdue * 10.0).trunc(),
            );
        }

        let expected = f64::from(expected_progress(node.created_at, deadline, now));
        if progress >= expected {
            return health(
                DeadlineStatus::OnTrack,
                (100.0 * progress / expected.max(1.0)).trunc(),
            );
        }
        let deficit = expected - progress;
        if deficit > 30.0 {
            health(DeadlineStatus::AtRisk, 50.0 - deficit)
        } else {
            health(DeadlineStatus::AtRisk, (70.0 - deficit).max(30.0))
        }
    }

    /// Linear model: with half the time between creation and deadline gone, half the
    /// work should be done.
    pub fn expected_progress(
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> u8 {
        let total = (deadline - created_at).num_milliseconds();
        if total <= 0 {
            return 100;
        }
        let elapsed = (now - created_at).num_milliseconds();
        if elapsed <= 0 {
            return 0;
        }
        (elapsed as f64 / total as f64 * 100.0).min(100.0) as u8
    }

    /// Whole days until the deadline, negative once it has passed.
    pub fn days_remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (deadline - now).num_days()
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct DeadlineSummary {
        pub total_with_deadline: usize,
        pub completed: usize,
        pub on_track: usize,
        pub at_risk: usize,
        pub overdue: usize,
    }

    /// Counts of task nodes carrying a deadline, by status.
    pub fn deadline_summary(state: &WorkingState, now: DateTime<Utc>) -> DeadlineSummary {
        let mut summary = DeadlineSummary::default();
        for node in state.nodes.values() {
            if node.kind != NodeType::Task || node.deadline.is_none() {
                continue;
            }
            summary.total_with_deadline += 1;
            match deadline_status(node, now).status {
                DeadlineStatus::Completed => summary.completed += 1,
                DeadlineStatus::OnTrack => summary.on_track += 1,
                DeadlineStatus::AtRisk => summary.at_risk += 1,
                DeadlineStatus::Overdue => summary.overdue += 1,
                DeadlineStatus::NoDeadline => {}
            }
        }
        summary
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::{Duration, TimeZone};

        fn t0() -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
        }

        fn node(id: &str, kind: NodeType, parent: Option<&str>) -> Node {
            Node::new(id.into(), kind, id.to_string(), parent.map(NodeId::from), t0())
        }

        fn task(progress: u8, deadline_days: Option<i64>) -> Node {
            let mut n = node("t", NodeType::Task, None);
            n.progress = progress;
            n.deadline = deadline_days.map(|d| t0() + Duration::days(d));
            n
        }

        #[test]
        fn durations() {
            assert_eq!(format_minutes(0), "0m");
            assert_eq!(format_minutes(45), "45m");
            assert_eq!(format_minutes(65), "1h 5m");
            assert_eq!(format_minutes(120), "2h 0m");
            assert_eq!(format_elapsed(0), "00:00:00");
            assert_eq!(format_elapsed(3_725), "01:02:05");
            assert_eq!(format_elapsed(90_000), "25:00:00");
        }

        #[test]
        fn renders_outline_with_markers() {
            let mut state = WorkingState::default();
            let mut goal = node("g", NodeType::Goal, None);
            goal.children = vec!["k".into(), "x".into()];
            let mut kr = node("k", NodeType::KeyResult, Some("g"));
            kr.children = vec!["i".into()];
            kr.rating = 3;
            kr.is_expanded = false;
            let i = node("i", NodeType::Initiative, Some("k"));
            let mut x = node("x", NodeType::Initiative, Some("g"));
            x.progress = 80;
            x.time_spent = 65;
            x.timer_started_at = Some(t0());
            for n in [goal, kr, i, x] {
                state.nodes.insert(n.id.clone(), n);
            }
            state.root_ids = vec!["g".into()];

            assert_eq!(
                render_tree(&state),
                "g [Goal] 0%\n\
                 ├── k [Key Result] 0% ★3 +\n\
                 └── x [Initiative] 80% · 1h 5m ▶\n"
            );
        }

        #[test]
        fn deadline_health_follows_linear_model() {
            let now = t0() + Duration::days(5);

            let done = deadline_status(&task(100, Some(1)), now);
            assert_eq!(done.status, DeadlineStatus::Completed);
            assert_eq!(done.health, 100);

            let none = deadline_status(&task(10, None), now);
            assert_eq!((none.status, none.health), (DeadlineStatus::NoDeadline, 50));

            // Three days late at 40% -> 40 - 30.
            let late = deadline_status(&task(40, Some(2)), now);
            assert_eq!((late.status, late.health), (DeadlineStatus::Overdue, 10));

            // Half way through a 10-day window.
            assert_eq!(expected_progress(t0(), t0() + Duration::days(10), now), 50);
            let ahead = deadline_status(&task(60, Some(10)), now);
            assert_eq!((ahead.status, ahead.health), (DeadlineStatus::OnTrack, 100));
            let slightly = deadline_status(&task(30, Some(10)), now);
            assert_eq!((slightly.status, slightly.health), (DeadlineStatus::AtRisk, 50));
            let badly = deadline_status(&task(5, Some(10)), now);
            assert_eq!((badly.status, badly.health), (DeadlineStatus::AtRisk, 5));
        }

        #[test]
        fn summary_counts_tasks_with_deadlines_only() {
            let now = t0() + Duration::days(5);
            let mut state = WorkingState::default();
            let mut overdue = task(0, Some(1));
            overdue.id = "a".into();
            let mut on_track = task(90, Some(10));
            on_track.id = "b".into();
            let mut undated = task(0, None);
            undated.id = "c".into();
            let mut goal = node("d", NodeType::Goal, None);
            goal.deadline = Some(t0());
            for n in [overdue, on_track, undated, goal] {
                state.nodes.insert(n.id.clone(), n);
            }

            assert_eq!(
                deadline_summary(&state, now),
                DeadlineSummary {
                    total_with_deadline: 2,
                    on_track: 1,
                    overdue: 1,
                    ..DeadlineSummary::default()
                }
            );
            assert_eq!(days_remaining(t0() + Duration::days(10), now), 5);
        }
    }
}
