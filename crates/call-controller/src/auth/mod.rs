//! Bearer token authentication.
//!
//! Clients present an HS256 JWT issued by the identity provider. The
//! `sub` claim is the caller's user id.

pub mod claims;
pub mod jwt;

pub use claims::Claims;
pub use jwt::JwtValidator;
