//! Sloop CLI library.

pub mod commands;
