pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

use futures::future::BoxFuture;

pub use error::{StorageError, StorageResult};
pub use ids::{SegmentId, SequenceId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{
    ElementHistory, ElementKind, NewSegment, NewUser, SegmentRecord, SequenceRecord, UserRecord,
};

pub trait UserStore: Send + Sync {
    fn add_user(&self, input: NewUser) -> BoxFuture<'_, StorageResult<UserRecord>>;
    fn user_id_for_username<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<UserId>>>;
    fn username_for_id(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<String>>>;
    fn rename_user<'a>(
        &'a self,
        user_id: UserId,
        new_username: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn user_exists(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<bool>>;
    fn username_exists<'a>(&'a self, username: &'a str) -> BoxFuture<'a, StorageResult<bool>>;
    /// Stores one key per user and key kind, replacing any previous value.
    fn upsert_api_key<'a>(
        &'a self,
        user_id: UserId,
        key_kind: &'a str,
        key_value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn api_key<'a>(
        &'a self,
        user_id: UserId,
        key_kind: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<String>>>;
    /// Records a subject the user has had a sequence written about.
    fn add_subject<'a>(&'a self, user_id: UserId, subject: &'a str)
    -> BoxFuture<'a, StorageResult<()>>;
    /// Recorded subjects, oldest first.
    fn subjects(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<String>>>;
}

pub trait SequenceStore: Send + Sync {
    fn add_sequence<'a>(
        &'a self,
        owner_id: UserId,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<SequenceRecord>>;
    /// Creates a sequence with all its segments, versions and active pointers in one
    /// transaction; nothing is kept when any part fails.
    fn store_sequence<'a>(
        &'a self,
        owner_id: UserId,
        name: &'a str,
        script: Option<String>,
        segments: Vec<NewSegment>,
    ) -> BoxFuture<'a, StorageResult<SequenceRecord>>;
    /// Replaces every segment of an existing sequence and its cached script in one
    /// transaction.
    fn replace_segments(
        &self,
        sequence_id: SequenceId,
        script: Option<String>,
        segments: Vec<NewSegment>,
    ) -> BoxFuture<'_, StorageResult<()>>;
    fn get_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> BoxFuture<'_, StorageResult<Option<SequenceRecord>>>;
    fn list_sequences(&self, owner_id: UserId) -> BoxFuture<'_, StorageResult<Vec<SequenceRecord>>>;
    fn rename_sequence<'a>(
        &'a self,
        sequence_id: SequenceId,
        new_name: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn set_sequence_script(
        &self,
        sequence_id: SequenceId,
        script: Option<String>,
    ) -> BoxFuture<'_, StorageResult<()>>;
    fn sequence_exists(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<bool>>;
    /// Case-insensitive; `owner_id = None` searches every owner.
    fn sequence_name_exists<'a>(
        &'a self,
        owner_id: Option<UserId>,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<bool>>;
}

pub trait SegmentStore: Send + Sync {
    /// Inserts a segment at `position` (append when `None`, clamped to `[0, count]`),
    /// shifting every segment at or after it up by one.
    fn add_segment(
        &self,
        sequence_id: SequenceId,
        position: Option<u32>,
    ) -> BoxFuture<'_, StorageResult<SegmentRecord>>;
    fn get_segment(&self, segment_id: SegmentId)
    -> BoxFuture<'_, StorageResult<Option<SegmentRecord>>>;
    /// Segments of a sequence ordered by position.
    fn get_segments(&self, sequence_id: SequenceId)
    -> BoxFuture<'_, StorageResult<Vec<SegmentRecord>>>;
    fn segment_at_position(
        &self,
        sequence_id: SequenceId,
        position: u32,
    ) -> BoxFuture<'_, StorageResult<Option<SegmentRecord>>>;
    fn segment_count(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<u32>>;
    /// Moves a segment to `new_position` (clamped to `[0, count - 1]`) and renumbers the rest.
    /// Returns `false` when the segment does not exist.
    fn move_segment(
        &self,
        segment_id: SegmentId,
        new_position: u32,
    ) -> BoxFuture<'_, StorageResult<bool>>;
    /// Deletes a segment with all its versions and closes the gap it leaves.
    fn remove_segment(&self, segment_id: SegmentId) -> BoxFuture<'_, StorageResult<bool>>;
    fn set_segment_label<'a>(
        &'a self,
        segment_id: SegmentId,
        label: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn clear_segments(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<u64>>;
    fn segment_exists(&self, segment_id: SegmentId) -> BoxFuture<'_, StorageResult<bool>>;
    fn position_exists(
        &self,
        sequence_id: SequenceId,
        position: u32,
    ) -> BoxFuture<'_, StorageResult<bool>>;
}

pub trait ElementVersionStore: Send + Sync {
    /// Appends the next version (0-based) and optionally makes it active.
    fn add_element_version(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        content: String,
        activate: bool,
    ) -> BoxFuture<'_, StorageResult<u32>>;
    /// Returns `false` when the segment or the version does not exist.
    fn set_active_version(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: u32,
    ) -> BoxFuture<'_, StorageResult<bool>>;
    /// All contents of one element ordered by version.
    fn element_versions(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
    ) -> BoxFuture<'_, StorageResult<Vec<String>>>;
    /// Content at `version`, or at the active version when `None`.
    fn element_content(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: Option<u32>,
    ) -> BoxFuture<'_, StorageResult<Option<String>>>;
    fn element_version_count(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
    ) -> BoxFuture<'_, StorageResult<u32>>;
    fn element_version_exists(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: u32,
    ) -> BoxFuture<'_, StorageResult<bool>>;
}

pub trait Storage: UserStore + SequenceStore + SegmentStore + ElementVersionStore {}

impl<T> Storage for T where T: UserStore + SequenceStore + SegmentStore + ElementVersionStore {}
