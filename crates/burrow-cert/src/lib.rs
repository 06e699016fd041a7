//! Certificate helpers for the broker's TLS listener
//!
//! Only self-signed generation lives here; operator-supplied PEM files are
//! loaded by `burrow-transport`.

pub mod self_signed;

pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate, SelfSignedError};
