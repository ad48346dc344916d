// Core domain types shared across all fieldsync crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

/// A row type that can be replicated into a collection.
///
/// Every synchronized table has a statically defined row structure. The
/// associated constants name the table on the wire and its primary-key column.
pub trait Row:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Table name used by the shape stream and mutation endpoints.
    const TABLE: &'static str;
    /// Primary-key column name.
    const KEY_FIELD: &'static str;
    /// Whether rows accept update/delete. Append-only tables set this to false.
    const MUTABLE: bool;

    fn key(&self) -> &str;

    /// Assign the client-generated primary key of a new row.
    fn set_key(&mut self, key: String);

    fn project_id(&self) -> i64;
}

// ── Entities ───────────────────────────────────────────────────────

/// Lifecycle state of a surveyable feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Ready,
    OpenedInOdk,
    SurveySubmitted,
    Validated,
    MarkedBad,
}

impl EntityStatus {
    pub const ALL: [Self; 5] = [
        Self::Ready,
        Self::OpenedInOdk,
        Self::SurveySubmitted,
        Self::Validated,
        Self::MarkedBad,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::OpenedInOdk => "OPENED_IN_ODK",
            Self::SurveySubmitted => "SURVEY_SUBMITTED",
            Self::Validated => "VALIDATED",
            Self::MarkedBad => "MARKED_BAD",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant { kind: "entity status", value: s.to_string() })
    }
}

/// One surveyable feature of a project (a map-task entity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub entity_id: String,
    pub status: EntityStatus,
    pub project_id: i64,
    pub task_id: i64,
    /// Kept as a string: OSM identifiers exceed the safe integer range of
    /// some producers, so both numbers and strings are accepted on input.
    #[serde(deserialize_with = "deserialize_osm_id")]
    pub osm_id: String,
    #[serde(default)]
    pub submission_ids: Vec<String>,
    #[serde(default)]
    pub geometry: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Row for Entity {
    const TABLE: &'static str = "odk_entities";
    const KEY_FIELD: &'static str = "entity_id";
    const MUTABLE: bool = true;

    fn key(&self) -> &str {
        &self.entity_id
    }

    fn set_key(&mut self, key: String) {
        self.entity_id = key;
    }

    fn project_id(&self) -> i64 {
        self.project_id
    }
}

// ── Task events ────────────────────────────────────────────────────

/// Kind of activity recorded against a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventKind {
    /// Claim a task for mapping.
    Map,
    Finish,
    Validate,
    /// Mark the mapping as good.
    Good,
    /// Mark the mapping as bad.
    Bad,
    Conflate,
    Split,
    Merge,
    Assign,
    Comment,
    Reset,
}

impl TaskEventKind {
    pub const ALL: [Self; 11] = [
        Self::Map,
        Self::Finish,
        Self::Validate,
        Self::Good,
        Self::Bad,
        Self::Conflate,
        Self::Split,
        Self::Merge,
        Self::Assign,
        Self::Comment,
        Self::Reset,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Map => "MAP",
            Self::Finish => "FINISH",
            Self::Validate => "VALIDATE",
            Self::Good => "GOOD",
            Self::Bad => "BAD",
            Self::Conflate => "CONFLATE",
            Self::Split => "SPLIT",
            Self::Merge => "MERGE",
            Self::Assign => "ASSIGN",
            Self::Comment => "COMMENT",
            Self::Reset => "RESET",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEventKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant { kind: "task event", value: s.to_string() })
    }
}

/// Task state resulting from an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    UnlockedToMap,
    LockedForMapping,
    UnlockedToValidate,
    LockedForValidation,
    UnlockedDone,
}

impl TaskStatus {
    pub const ALL: [Self; 5] = [
        Self::UnlockedToMap,
        Self::LockedForMapping,
        Self::UnlockedToValidate,
        Self::LockedForValidation,
        Self::UnlockedDone,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnlockedToMap => "UNLOCKED_TO_MAP",
            Self::LockedForMapping => "LOCKED_FOR_MAPPING",
            Self::UnlockedToValidate => "UNLOCKED_TO_VALIDATE",
            Self::LockedForValidation => "LOCKED_FOR_VALIDATION",
            Self::UnlockedDone => "UNLOCKED_DONE",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant { kind: "task status", value: s.to_string() })
    }
}

impl TaskEventKind {
    /// Task state after this event is recorded against a task in `current`.
    ///
    /// Events that do not move the task (comments, assignment, splitting)
    /// leave it where it was.
    pub fn resulting_status(self, current: TaskStatus) -> TaskStatus {
        match self {
            Self::Map => TaskStatus::LockedForMapping,
            Self::Finish => TaskStatus::UnlockedToValidate,
            Self::Validate => TaskStatus::LockedForValidation,
            Self::Good => TaskStatus::UnlockedDone,
            Self::Bad | Self::Reset => TaskStatus::UnlockedToMap,
            Self::Conflate | Self::Split | Self::Merge | Self::Assign | Self::Comment => current,
        }
    }
}

/// Append-only activity record for a task. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub event_id: String,
    pub event: TaskEventKind,
    pub project_id: i64,
    pub task_id: i64,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub username: String,
    #[serde(default)]
    pub profile_img: Option<String>,
    pub status: TaskStatus,
}

impl Row for TaskEvent {
    const TABLE: &'static str = "task_events";
    const KEY_FIELD: &'static str = "event_id";
    const MUTABLE: bool = false;

    fn key(&self) -> &str {
        &self.event_id
    }

    fn set_key(&mut self, key: String) {
        self.event_id = key;
    }

    fn project_id(&self) -> i64 {
        self.project_id
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Returned when parsing an enum from user input fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

fn deserialize_osm_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct OsmIdVisitor;

    impl Visitor<'_> for OsmIdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an OSM id as a string or integer")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(OsmIdVisitor)
}
