//! CLI commands

pub mod hibernate;
