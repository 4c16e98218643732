//! Engine-level terminal errors.

/// Terminal conditions the engine itself reports.
///
/// Per-peer dial and query failures are never terminal; they accumulate
/// and only surface when every seen peer has failed, in which case the
/// first accumulated error is returned instead of this enum. Cancellation
/// is its own variant so callers can downcast it out of an error chain.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The ambient cancellation scope was closed while the query ran.
    #[error("query cancelled")]
    Cancelled,
}
