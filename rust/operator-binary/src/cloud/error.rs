use snafu::Snafu;

/// The cloud-error taxonomy, collapsed to kinds rather than one
/// variant per SDK call: transient errors are retried by the SDK or by the
/// caller and never reach here; this is what a provisioner actually has to
/// branch on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CloudError {
    #[snafu(display("{service} {operation} on {resource} failed"))]
    Api {
        service: &'static str,
        operation: &'static str,
        resource: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("{service} {operation} on {resource} is in an unrecoverable state: {detail}"))]
    Unrecoverable {
        service: &'static str,
        operation: &'static str,
        resource: String,
        detail: String,
    },

    #[snafu(display("retry budget exhausted for {operation} on {resource}"))]
    RetryBudgetExhausted {
        operation: &'static str,
        resource: String,
    },
}

impl CloudError {
    /// Whether this failure should be surfaced to the reconcile driver as
    /// `Err`, as opposed to being swallowed as "transient, try again next
    /// requeue".
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloudError::Unrecoverable { .. } | CloudError::RetryBudgetExhausted { .. }
        )
    }
}
