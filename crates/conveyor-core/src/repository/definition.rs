//! Definition store trait.

use conveyor_types::definition::WorkflowDefinition;
use conveyor_types::error::RepositoryError;

/// Storage for pipeline definitions, keyed by workflow name.
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace the definition with the same name.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn find_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}
