//! Identity: bearer tokens issued by the external identity provider.

mod jwt;

pub use jwt::{Claims, Identity, JwtSecret};
