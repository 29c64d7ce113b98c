use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Backing errors for all AWS operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed API")]
    API { message: String, is_retryable: bool },
    #[error("failed for other reasons")]
    Other { message: String, is_retryable: bool },
}

impl Error {
    /// Returns the error message in "String".
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Error::API { message, .. } | Error::Other { message, .. } => message.clone(),
        }
    }

    /// Returns if the error is retryable.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::API { is_retryable, .. } | Error::Other { is_retryable, .. } => *is_retryable,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e.message())
    }
}

#[test]
fn test_error_message() {
    let e = Error::API {
        message: String::from("failed describe_vpcs"),
        is_retryable: true,
    };
    assert_eq!(e.message(), "failed describe_vpcs");
    assert!(e.is_retryable());

    let e = Error::Other {
        message: String::from("key path already exists"),
        is_retryable: false,
    };
    assert!(!e.is_retryable());
}
