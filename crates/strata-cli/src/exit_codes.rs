//! Process exit codes. Part of the public contract.
//!
//! Failures map through [`strata_core::ErrorKind::exit_code`]; the constants
//! here cover what the error taxonomy does not.

pub const EXIT_SUCCESS: i32 = 0;

/// Failure that did not originate in a [`strata_core::BundleError`].
pub const EXIT_INTERNAL: i32 = 5;

/// Exit code for a command failure.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<strata_core::BundleError>())
        .map(|e| e.exit_code())
        .unwrap_or(EXIT_INTERNAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use strata_core::BundleError;

    #[test]
    fn test_bundle_errors_keep_their_code() {
        let err = anyhow::Error::new(BundleError::not_found("bundle team/x:1"));
        assert_eq!(for_error(&err), 1);

        let wrapped: anyhow::Result<()> = Err(BundleError::validation("bad yaml"))
            .context("while loading strata.yaml");
        assert_eq!(for_error(&wrapped.unwrap_err()), 2);
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err = anyhow::anyhow!("stdout closed");
        assert_eq!(for_error(&err), EXIT_INTERNAL);
    }
}
