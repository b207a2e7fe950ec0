//! Router configuration
//!
//! Provider pairing is fixed (a daily-capped primary and a credit-based
//! secondary); everything about each side — endpoint, model, ceilings — is
//! data in a [`ProviderProfile`]. Defaults describe the Gemini free tier and
//! OpenAI pay-as-you-go, overridable via environment variables named in
//! [`keys`].

pub mod keys;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::api::ProviderId;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Build-time description of one provider slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Human-readable backend name ("gemini", "openai")
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Daily request cap; `None` means credit-based / effectively uncapped
    pub daily_cap: Option<u32>,
    /// Client-side requests-per-minute ceiling
    pub requests_per_minute: u32,
    /// Client-side in-flight ceiling
    pub max_concurrent: u32,
    /// Environment variable holding this provider's API key
    pub api_key_env: String,
}

impl ProviderProfile {
    /// Gemini free-tier defaults for the primary slot
    pub fn gemini() -> Self {
        Self {
            name: "gemini".to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            model: "gemini-2.0-flash".to_string(),
            daily_cap: Some(50), // free-tier daily request cap
            requests_per_minute: 10,
            max_concurrent: 2,
            api_key_env: keys::GEMINI_API_KEY.to_string(),
        }
    }

    /// OpenAI pay-as-you-go defaults for the secondary slot
    pub fn openai() -> Self {
        Self {
            name: "openai".to_string(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            daily_cap: None,
            requests_per_minute: 60,
            max_concurrent: 4,
            api_key_env: keys::OPENAI_API_KEY.to_string(),
        }
    }

    /// Whether this provider enforces a fixed daily cap
    pub fn is_daily_capped(&self) -> bool {
        self.daily_cap.is_some()
    }
}

/// Complete router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub primary: ProviderProfile,
    pub secondary: ProviderProfile,
    /// Pin routing to this provider while it stays usable
    pub preferred: Option<ProviderId>,
    /// File to persist quota records to; `None` keeps them in memory
    pub quota_path: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: ProviderProfile::gemini(),
            secondary: ProviderProfile::openai(),
            preferred: None,
            quota_path: None,
        }
    }
}

impl RouterConfig {
    /// Look up a profile by provider id
    pub fn profile(&self, provider: ProviderId) -> &ProviderProfile {
        match provider {
            ProviderId::Primary => &self.primary,
            ProviderId::Secondary => &self.secondary,
        }
    }

    /// Build configuration from defaults plus environment overrides
    ///
    /// Only the variables in [`keys`] are consulted; unset or unparsable
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(keys::PRIMARY_BASE_URL) {
            if !url.is_empty() {
                config.primary.base_url = url;
            }
        }
        if let Ok(url) = std::env::var(keys::SECONDARY_BASE_URL) {
            if !url.is_empty() {
                config.secondary.base_url = url;
            }
        }
        if let Ok(model) = std::env::var(keys::PRIMARY_MODEL) {
            if !model.is_empty() {
                config.primary.model = model;
            }
        }
        if let Ok(model) = std::env::var(keys::SECONDARY_MODEL) {
            if !model.is_empty() {
                config.secondary.model = model;
            }
        }
        if let Ok(cap) = std::env::var(keys::PRIMARY_DAILY_CAP) {
            if let Ok(cap) = cap.parse::<u32>() {
                config.primary.daily_cap = Some(cap);
            }
        }
        if let Ok(pref) = std::env::var(keys::ROUTER_PREFERRED) {
            config.preferred = match pref.to_lowercase().as_str() {
                "primary" => Some(ProviderId::Primary),
                "secondary" => Some(ProviderId::Secondary),
                _ => None,
            };
        }
        if let Ok(path) = std::env::var(keys::QUOTA_PATH) {
            if !path.is_empty() {
                config.quota_path = Some(PathBuf::from(path));
            }
        }

        config
    }
}
