//! Configuration loading and validation for toolhost.
//!
//! Config files: `toolhost.toml`, `toolhost.yaml`, or `toolhost.json`,
//! searched in `./` then `~/.config/toolhost/`.
//!
//! Supports `${ENV_VAR}` substitution in server launch parameters.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config, load_or_disabled},
    schema::{
        FallbackBindingEntry, FallbackConfig, FallbackMode, ManagerSettings, ServerDescriptor,
        ToolhostConfig,
    },
    validate::{
        Diagnostic, KNOWN_FALLBACK_IMPLEMENTATIONS, Severity, ValidationResult, sanitize,
        validate_config, validate_toml_str,
    },
};
