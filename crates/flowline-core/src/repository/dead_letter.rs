//! Dead letter repository trait.

use chrono::{DateTime, Utc};
use flowline_types::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use flowline_types::error::RepositoryError;
use uuid::Uuid;

pub trait DeadLetterRepository: Send + Sync {
    fn get_dead_letter(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DeadLetterEntry>, RepositoryError>> + Send;

    /// Insert if absent. Returns `false` if the execution already has one.
    fn insert_dead_letter(
        &self,
        entry: &DeadLetterEntry,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn compare_and_swap_dead_letter(
        &self,
        entry: &DeadLetterEntry,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Pending entries with `next_retry_at <= now`, oldest due first.
    fn list_due_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DeadLetterEntry>, RepositoryError>> + Send;

    fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DeadLetterEntry>, RepositoryError>> + Send;
}
