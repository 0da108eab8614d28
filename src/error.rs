/// Errors surfaced by the statistics engine.
///
/// None of these are ever returned into an instrumented query's result; hooks swallow them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The statement text (the aggregation key) was empty, so the record was dropped.
    #[error("statement text is empty")]
    EmptyInput,
    /// Draining the ingestion channel did not finish within the allowed time.
    #[error("timed out draining buffered statistics")]
    TimedOut,
    /// The engine is stopping or stopped and no longer accepts records.
    #[error("statistics engine is stopped")]
    Stopped,
    /// A read through the store failed. Write failures are logged, never returned.
    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}
