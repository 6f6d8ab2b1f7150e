//! # clustree-id
//!
//! Typed identifiers for the clustree services.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `clu_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a cluster
//! - `usr_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a user account
//! - `job_01HV4Z4NYPLTRS0JTUA8XDME5F` for one solver invocation
//!
//! Parsing is strict: the prefix must match the type, so a user id can never
//! be passed where a cluster id is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

#[doc(hidden)]
pub fn parse_prefixed(expected: &'static str, s: &str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, body)) = s.split_once('_') else {
        return Err(IdError::NoSeparator);
    };

    if prefix != expected {
        return Err(IdError::WrongPrefix {
            expected,
            found: prefix.to_string(),
        });
    }

    body.parse::<Ulid>()
        .map_err(|e| IdError::BadUlid(e.to_string()))
}
