//! Build-time identity of the binary.
//!
//! Release builds inject these through compile-time environment variables
//! (the release script sets them before `cargo build`); local builds fall
//! back to development values, most importantly the version sentinel that
//! keeps the updater from acting on a non-release binary.

use molt_core::update::DEV_VERSION;

/// Application name; binaries, directories, and unit names derive from it.
pub const NAME: &str = match option_env!("MOLT_NAME") {
    Some(name) => name,
    None => "molt",
};

/// Running version, `v`-prefixed on releases.
pub const VERSION: &str = match option_env!("MOLT_VERSION") {
    Some(version) => version,
    None => DEV_VERSION,
};

/// Base URL of the release server (`/version` and `/install.sh` live here).
pub const RELEASE_URL: &str = match option_env!("MOLT_RELEASE_URL") {
    Some(url) => url,
    None => "https://releases.molt.dev/molt",
};

const SERVICE_ENABLED_RAW: &str = match option_env!("MOLT_SERVICE_ENABLED") {
    Some(raw) => raw,
    None => "false",
};

/// Whether this binary was built to run under a service supervisor. Decides
/// the detachment strategy for updates.
#[must_use]
pub fn service_enabled() -> bool {
    SERVICE_ENABLED_RAW == "true"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_build_carries_the_sentinel() {
        // Local builds must never look like releases.
        assert_eq!(VERSION, DEV_VERSION);
        assert!(!service_enabled());
        assert!(!NAME.is_empty());
    }
}
