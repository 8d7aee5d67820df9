use std::time::Duration;

// Manifest discovery
pub const DEFAULT_MANIFEST: &str = ".replit";
pub const MANIFEST_ENV: &str = "ENVBOOT_MANIFEST";

// Logging
pub const LOG_ENV: &str = "ENVBOOT_LOG";

// Readiness gate (waitForPort)
pub const READY_TIMEOUT_ENV: &str = "ENVBOOT_READY_TIMEOUT_SECS";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const READY_HOST: &str = "127.0.0.1";

// Process launch
pub const SHELL: &str = "sh";

// Provisioning
pub const NIX_ENV: &str = "nix-env";
pub const NIXPKGS_ATTR_PREFIX: &str = "nixpkgs.";
pub const PROVISION_RECORD: &str = "envboot/provisioned.json";

/// Readiness timeout, honouring `ENVBOOT_READY_TIMEOUT_SECS` when it parses.
pub fn ready_timeout() -> Duration {
    std::env::var(READY_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_READY_TIMEOUT)
}
