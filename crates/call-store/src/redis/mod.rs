//! Redis store backend.

pub mod client;
pub mod lua_scripts;

pub use client::RedisStore;
