#![forbid(unsafe_code)]

//! Republishes Creative-Commons vertical shorts: search, download, check the
//! aspect ratio, upload under a new listing, and remember what was already
//! done so nothing goes out twice.

pub mod auth;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod probe;
pub mod publish;
pub mod retrieve;
pub mod security;
pub mod store;
pub mod youtube;
