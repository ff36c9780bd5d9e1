//! Operator command line

pub mod commands;
