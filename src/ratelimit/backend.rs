//! Admission trait consumed by the entry layer.

use async_trait::async_trait;

use super::limiter::Decision;
use crate::error::Result;

/// Trait for admission-control implementations.
///
/// The HTTP layer depends on this trait rather than on [`super::RateLimiter`]
/// directly, so it can be exercised against stub implementations.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether `subject` may call `resource` now.
    ///
    /// An `Err` means the decision could not be made (the window store was
    /// unavailable); it is never a disguised denial.
    async fn decide(&self, subject: &str, resource: &str) -> Result<Decision>;
}
