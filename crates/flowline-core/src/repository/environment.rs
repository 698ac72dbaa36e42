//! Environment configuration and promotion repository trait.

use flowline_types::environment::{Environment, EnvironmentConfig, Promotion};
use flowline_types::error::RepositoryError;
use uuid::Uuid;

pub trait EnvironmentRepository: Send + Sync {
    fn get_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> impl std::future::Future<Output = Result<Option<EnvironmentConfig>, RepositoryError>> + Send;

    /// Upsert by (workflow_id, environment).
    fn save_environment(
        &self,
        config: &EnvironmentConfig,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn delete_environment(
        &self,
        workflow_id: &str,
        environment: Environment,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Upsert by id.
    fn save_promotion(
        &self,
        promotion: &Promotion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_promotion(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Promotion>, RepositoryError>> + Send;

    /// Most recent first.
    fn list_promotions(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Promotion>, RepositoryError>> + Send;
}
