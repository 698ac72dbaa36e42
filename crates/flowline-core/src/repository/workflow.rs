//! Workflow definition repository trait.

use flowline_types::error::RepositoryError;
use flowline_types::workflow::WorkflowDefinition;

pub trait WorkflowRepository: Send + Sync {
    /// Upsert a definition by id.
    fn save_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}
