/// Runtime configuration for a memory engine.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryEngineConfig {
    /// A failed request aborts its transaction with the request's error.
    pub abort_on_request_error: bool,
    /// Let other tasks run between two requests of the same transaction.
    pub yield_between_requests: bool,
    /// Write file snapshots indented (file-backed engines only).
    pub pretty_snapshots: bool,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            abort_on_request_error: true,
            yield_between_requests: true,
            pretty_snapshots: true,
        }
    }
}
