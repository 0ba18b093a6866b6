//! Outcome notification port.

use super::BackendError;

/// Delivers task outcome notifications. Delivery failures are logged by the
/// caller and never affect task status.
pub trait Notifier: Send + Sync {
    fn notify_failure(
        &self,
        owner: &str,
        title: &str,
        cause: &str,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    fn notify_success(
        &self,
        owner: &str,
        title: &str,
        detail: &str,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// Notifier that drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn notify_failure(&self, _owner: &str, _title: &str, _cause: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn notify_success(&self, _owner: &str, _title: &str, _detail: &str) -> Result<(), BackendError> {
        Ok(())
    }
}
