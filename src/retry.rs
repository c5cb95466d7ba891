//! Support utilities for [`keen_retry`]'s retry API.

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use keen_retry::RetryResult;

/// Error codes the OCR service uses when we exceed a rate or concurrency
/// quota. These are the only errors we retry.
pub const THROTTLING_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "LimitExceededException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
];

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_potentially_transient;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

/// Does this error code belong to the throttling family?
pub fn is_throttling_code(code: Option<&str>) -> bool {
    code.is_some_and(|code| THROTTLING_ERROR_CODES.contains(&code))
}

/// AWS SDK errors are only transient when the service tells us to slow down.
/// Timeouts and dispatch failures are left to the SDK's own retry layer.
impl<E, R> IsKnownTransient for SdkError<E, R>
where
    E: ProvideErrorMetadata,
{
    fn is_known_transient(&self) -> bool {
        is_throttling_code(self.code())
    }
}
