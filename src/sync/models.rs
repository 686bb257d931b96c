use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::errors::{BoardError, MappingKind};

/// Prefix marking ids minted locally for items the server has not acknowledged yet.
pub const TENTATIVE_PREFIX: &str = "tmp-";

/// Opaque work item id. Backends send either strings or integers; both land here as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a local id for a quick-created item.
    pub fn tentative() -> Self {
        Self(format!("{TENTATIVE_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_tentative(&self) -> bool {
        self.0.starts_with(TENTATIVE_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        string_or_number(deserializer).map(Self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Int(n) => n.to_string(),
    })
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
        RawId::Text(s) => s,
        RawId::Int(n) => n.to_string(),
    }))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn clamped_progress<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    Ok(raw.clamp(0.0, 100.0).round() as u8)
}

/// A named UI stage. Declaration order is the left-to-right board order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Backlog,
    Todo,
    InProgress,
    ReviewDic,
    ReviewIdc,
    ReviewDcc,
    Done,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::Backlog,
        Column::Todo,
        Column::InProgress,
        Column::ReviewDic,
        Column::ReviewIdc,
        Column::ReviewDcc,
        Column::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::ReviewDic => "review_dic",
            Self::ReviewIdc => "review_idc",
            Self::ReviewDcc => "review_dcc",
            Self::Done => "done",
        }
    }

    /// Position of this column on the board, leftmost is 0.
    pub fn ordinal(&self) -> usize {
        Self::ALL
            .iter()
            .position(|c| c == self)
            .unwrap_or_default()
    }

    /// The column to the left (`-1`) or right (`+1`) on the board, if any.
    pub fn neighbor(&self, step: isize) -> Option<Column> {
        let target = self.ordinal().checked_add_signed(step)?;
        Self::ALL.get(target).copied()
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Column {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BoardError::unknown(MappingKind::Column, s))
    }
}

/// The coarser status enum persisted server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

impl BackendStatus {
    pub const ALL: [BackendStatus; 4] = [
        BackendStatus::Todo,
        BackendStatus::InProgress,
        BackendStatus::Review,
        BackendStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendStatus {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| BoardError::unknown(MappingKind::Status, s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(BoardError::unknown(MappingKind::Priority, s)),
        }
    }
}

/// A unit of work tracked by the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeSet<String>,
    pub status: BackendStatus,
    #[serde(default, deserialize_with = "clamped_progress")]
    pub progress: u8,
    #[serde(default, deserialize_with = "string_or_number")]
    pub discipline_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build the local copy of a quick-created item.
    pub fn from_draft(id: ItemId, draft: &ItemDraft, discipline_id: &str) -> Self {
        Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            priority: draft.priority,
            assignee_id: draft.assignee_id.clone(),
            due_date: draft.due_date,
            tags: draft.tags.clone(),
            status: BackendStatus::Todo,
            progress: 0,
            discipline_id: discipline_id.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Names of the fields whose values differ between `self` and `previous`.
    pub fn changed_fields(&self, previous: &WorkItem) -> Vec<String> {
        let mut fields = Vec::new();
        let mut check = |name: &str, differs: bool| {
            if differs {
                fields.push(name.to_string());
            }
        };
        check("title", self.title != previous.title);
        check("description", self.description != previous.description);
        check("priority", self.priority != previous.priority);
        check("assignee_id", self.assignee_id != previous.assignee_id);
        check("due_date", self.due_date != previous.due_date);
        check("tags", self.tags != previous.tags);
        check("status", self.status != previous.status);
        check("progress", self.progress != previous.progress);
        check("discipline_id", self.discipline_id != previous.discipline_id);
        fields
    }

    /// Every field name, as reported for items seen for the first time.
    pub fn all_fields() -> Vec<String> {
        [
            "title",
            "description",
            "priority",
            "assignee_id",
            "due_date",
            "tags",
            "status",
            "progress",
            "discipline_id",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

/// Fields a user supplies when quick-creating an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ItemDraft {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// The `(project, discipline)` pair that keys both the board fetch and the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Scope {
    project_id: String,
    discipline_id: String,
}

impl Scope {
    pub fn new(
        project_id: impl Into<String>,
        discipline_id: impl Into<String>,
    ) -> Result<Self, BoardError> {
        let project_id = project_id.into().trim().to_string();
        let discipline_id = discipline_id.into().trim().to_string();
        if project_id.is_empty() {
            return Err(BoardError::Validation("project id is required".into()));
        }
        if discipline_id.is_empty() {
            return Err(BoardError::Validation("discipline id is required".into()));
        }
        Ok(Self {
            project_id,
            discipline_id,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn discipline_id(&self) -> &str {
        &self.discipline_id
    }

    /// Channel name used for the realtime subscription.
    pub fn channel_key(&self) -> String {
        format!("board:{}:{}", self.project_id, self.discipline_id)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.discipline_id)
    }
}

/// Column -> ordered item ids. Every column key is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Board {
    columns: BTreeMap<Column, Vec<ItemId>>,
}

impl Default for Board {
    fn default() -> Self {
        Self::empty()
    }
}

impl Board {
    pub fn empty() -> Self {
        Self {
            columns: Column::ALL.into_iter().map(|c| (c, Vec::new())).collect(),
        }
    }

    pub fn column(&self, column: Column) -> &[ItemId] {
        self.columns.get(&column).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Column, &[ItemId])> {
        self.columns.iter().map(|(c, ids)| (*c, ids.as_slice()))
    }

    pub fn position_of(&self, item_id: &ItemId) -> Option<(Column, usize)> {
        self.iter().find_map(|(column, ids)| {
            ids.iter()
                .position(|id| id == item_id)
                .map(|index| (column, index))
        })
    }

    pub fn column_of(&self, item_id: &ItemId) -> Option<Column> {
        self.position_of(item_id).map(|(column, _)| column)
    }

    /// How many times `item_id` appears across all columns (0 or 1 when the invariant holds).
    pub fn occurrences(&self, item_id: &ItemId) -> usize {
        self.columns
            .values()
            .map(|ids| ids.iter().filter(|id| *id == item_id).count())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn column_mut(&mut self, column: Column) -> &mut Vec<ItemId> {
        self.columns.entry(column).or_default()
    }
}

/// A normalized board plus the items it references. Produced at the fetch boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardData {
    pub board: Board,
    pub items: BTreeMap<ItemId, WorkItem>,
}

/// Read-only copy of the store handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub scope: Option<Scope>,
    pub board: Board,
    pub items: BTreeMap<ItemId, WorkItem>,
    pub is_fallback: bool,
    pub live_updates: bool,
}

impl BoardSnapshot {
    /// Items of one column in on-screen order.
    pub fn items_in(&self, column: Column) -> Vec<&WorkItem> {
        self.board
            .column(column)
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect()
    }
}

/// Row operation carried by a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Whether an inbound change echoes a write this session issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Remote,
    Echo,
}

/// A normalized inbound notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub item_id: ItemId,
    pub kind: ChangeKind,
    pub changed_fields: Vec<String>,
    pub origin: ChangeOrigin,
}
