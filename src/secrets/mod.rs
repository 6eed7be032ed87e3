//! Secret value handling shared by the store client, the local state file
//! and the credential publisher.

pub mod types;

pub use types::{exposed, SecretString};
