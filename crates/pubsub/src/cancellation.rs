use futures::future::select_all;
use tokio_util::sync::CancellationToken;

/// A cancellation scope that is signaled as soon as any of its inputs is.
///
/// Inputs are plain [`CancellationToken`]s, so cancellation is monotonic: once
/// an input has been cancelled the composite stays cancelled.
#[derive(Clone, Debug, Default)]
pub struct CompositeCancellation {
    scopes: Vec<CancellationToken>,
}

impl CompositeCancellation {
    /// Creates an empty composite that is never cancelled.
    #[must_use]
    pub const fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Adds an input scope.
    #[must_use]
    pub fn with(mut self, scope: CancellationToken) -> Self {
        self.scopes.push(scope);
        self
    }

    /// Adds an input scope if one is given.
    #[must_use]
    pub fn with_optional(self, scope: Option<CancellationToken>) -> Self {
        match scope {
            Some(scope) => self.with(scope),
            None => self,
        }
    }

    /// Whether any input has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.scopes.iter().any(CancellationToken::is_cancelled)
    }

    /// Resolves once any input is cancelled. Never resolves if there are none.
    pub async fn cancelled(&self) {
        if self.scopes.is_empty() {
            return std::future::pending().await;
        }

        select_all(self.scopes.iter().map(|scope| Box::pin(scope.cancelled()))).await;
    }
}
