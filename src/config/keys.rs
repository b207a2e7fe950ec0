//! Environment variable names used by the router
//!
//! Centralized constants so variable names stay consistent across the
//! codebase and in documentation.

// =============================================================================
// Provider API keys
// =============================================================================

/// API key for the primary (daily-capped) provider
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";

/// API key for the secondary (credit-based) provider
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

// =============================================================================
// Router configuration
// =============================================================================

/// Pin routing to one provider while it stays usable ("primary" / "secondary")
pub const ROUTER_PREFERRED: &str = "LLM_ROUTER_PREFERRED";

/// Override the primary provider's base URL
pub const PRIMARY_BASE_URL: &str = "LLM_ROUTER_PRIMARY_BASE_URL";

/// Override the secondary provider's base URL
pub const SECONDARY_BASE_URL: &str = "LLM_ROUTER_SECONDARY_BASE_URL";

/// Override the primary provider's model id
pub const PRIMARY_MODEL: &str = "LLM_ROUTER_PRIMARY_MODEL";

/// Override the secondary provider's model id
pub const SECONDARY_MODEL: &str = "LLM_ROUTER_SECONDARY_MODEL";

/// Override the primary provider's daily request cap
pub const PRIMARY_DAILY_CAP: &str = "LLM_ROUTER_PRIMARY_DAILY_CAP";

/// Path for the persisted quota record file
pub const QUOTA_PATH: &str = "LLM_ROUTER_QUOTA_PATH";

/// All router configuration keys
pub const CONFIG_KEYS: &[&str] = &[
    ROUTER_PREFERRED,
    PRIMARY_BASE_URL,
    SECONDARY_BASE_URL,
    PRIMARY_MODEL,
    SECONDARY_MODEL,
    PRIMARY_DAILY_CAP,
    QUOTA_PATH,
];

/// All provider API key variables
pub const API_KEYS: &[&str] = &[GEMINI_API_KEY, OPENAI_API_KEY];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_constants() {
        assert_eq!(GEMINI_API_KEY, "GEMINI_API_KEY");
        assert_eq!(OPENAI_API_KEY, "OPENAI_API_KEY");
    }

    #[test]
    fn config_keys_cover_overrides() {
        assert!(CONFIG_KEYS.contains(&PRIMARY_DAILY_CAP));
        assert!(CONFIG_KEYS.contains(&ROUTER_PREFERRED));
    }
}
