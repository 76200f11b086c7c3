//! Navigation collaborator.

/// Fire-and-forget route changes requested by workflows.
///
/// Navigation is never awaited for correctness.
pub trait Navigator: Send + Sync + 'static {
    /// Whether a router is mounted. Workflows skip navigation otherwise.
    fn has_router(&self) -> bool {
        true
    }

    fn go_to(&self, path: &str);
}

/// Navigator for headless engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn has_router(&self) -> bool {
        false
    }

    fn go_to(&self, _path: &str) {}
}
