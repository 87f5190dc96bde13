use std::io;

use thiserror::Error;

/// Every failure an engine call can report.
///
/// Calls that return an error leave the engine exactly as it was before the
/// call: validation always happens before any state is touched.
#[derive(Error, Debug)]
pub enum SingularityError {
    /// Constructor arguments or tunables are out of range. No engine is built.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Parallel argument sequences disagree in length.
    #[error("argument length mismatch for {what}: expected {expected}, found {found}")]
    ArgumentLengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A Hamiltonian rule failed validation (strength or action index).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Non-finite numbers or out-of-range indices at the call boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Snapshot shape (state size or category sizes) differs from this engine.
    #[error("incompatible configuration: {0}")]
    IncompatibleConfiguration(String),

    /// Snapshot bytes are corrupt, truncated or incomplete.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// Snapshot was written by a different layout version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// File-level I/O for the path based snapshot helpers.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type SingularityResult<T> = Result<T, SingularityError>;

/// Reject NaN and infinities before they reach the state vector.
pub(crate) fn ensure_finite(what: &str, value: f32) -> SingularityResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SingularityError::InvalidArgument(format!(
            "{what} must be finite, got {value}"
        )))
    }
}

pub(crate) fn ensure_all_finite(what: &str, values: &[f32]) -> SingularityResult<()> {
    match values.iter().position(|v| !v.is_finite()) {
        None => Ok(()),
        Some(i) => Err(SingularityError::InvalidArgument(format!(
            "{what}[{i}] must be finite, got {}",
            values[i]
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_checks_name_the_offending_index() {
        assert!(ensure_all_finite("observation", &[0.0, 1.5, -2.0]).is_ok());
        let err = ensure_all_finite("observation", &[0.0, f32::NAN]).unwrap_err();
        assert!(err.to_string().contains("observation[1]"));
        assert!(matches!(
            ensure_finite("reward", f32::INFINITY),
            Err(SingularityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn version_error_reports_both_versions() {
        let err = SingularityError::UnsupportedVersion {
            found: 7,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported snapshot version 7 (expected 1)"
        );
    }
}
