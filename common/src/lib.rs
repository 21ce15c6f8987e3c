pub mod system;

/// Provides validation functionality for types that need to verify their
/// internal state before being put to use.
///
/// The `ResultType` type parameter specifies the return type of the
/// validation, typically a bool or a `Result` carrying the specific
/// validation error.
pub trait Validate<ResultType> {
    /// Performs a validation of the type's internal state.
    ///
    /// # Return
    /// Returns a `ResultType` indicating whether validation succeeded or
    /// failed. The exact meaning of success/failure is defined by the
    /// implementing type.
    fn validate(&self) -> ResultType;
}
