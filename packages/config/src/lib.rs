// ABOUTME: Configuration and environment variable management for NeuroForge
// ABOUTME: Exposes env var names and lenient readers shared by the sandbox and memory packages

pub mod constants;
pub mod env;

pub use env::{flag, list, parse_in_range, parse_or, string, EnvSource, ProcessEnv};
