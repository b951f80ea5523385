//! Secret handling utilities.
//!
//! Re-exports secrecy types and redacts credentials from storage URIs
//! before they reach logs.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// The storage URI with any `user:password@` section replaced by `***@`.
pub fn redacted_uri(uri: &SecretString) -> String {
    let uri = uri.expose_secret();
    match uri.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => uri.to_string(),
        },
        None => "<invalid uri>".to_string(),
    }
}
