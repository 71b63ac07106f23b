//! Configuration loading for the gateway.
//!
//! Config files (`portico.toml` / `.yaml` / `.json`) are discovered
//! project-local first, then user-global, parsed with `${ENV}`
//! substitution, and handed to the gateway as read-only inputs. Nothing
//! in the gateway core mutates configuration at runtime.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, config_dir, discover_and_load, load_config, set_config_dir},
    schema::{AuthConfig, AuthModeConfig, GatewayConfig, PorticoConfig},
};
