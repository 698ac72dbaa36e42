//! Batch window repository trait.

use chrono::{DateTime, Utc};
use flowline_types::batch::BatchWindow;
use flowline_types::error::RepositoryError;

pub trait BatchWindowRepository: Send + Sync {
    fn get_window(
        &self,
        workflow_id: &str,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<BatchWindow>, RepositoryError>> + Send;

    /// Insert if absent. Returns `false` if the window already exists.
    fn insert_window(
        &self,
        window: &BatchWindow,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn compare_and_swap_window(
        &self,
        window: &BatchWindow,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Non-empty windows whose `window_closes_at <= now`.
    fn list_expired_windows(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<BatchWindow>, RepositoryError>> + Send;
}
