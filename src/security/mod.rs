/// Session credentials that never leak into logs
pub mod credentials;

pub use credentials::{Credentials, CredentialsError, SessionToken};
