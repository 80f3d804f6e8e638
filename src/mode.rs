use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const APP_ENV: &str = "APP_ENV";

/// Process-wide environment selector, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Debug,
    #[default]
    Release,
}

impl Mode {
    /// `development`, `debug`, `local` and `test` run in debug mode; anything else,
    /// blank included, is release.
    #[must_use]
    pub fn from_app_env(app_env: &str) -> Self {
        match app_env.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "debug" | "local" | "test" => Self::Debug,
            _ => Self::Release,
        }
    }

    /// Read `APP_ENV` from the process environment; unset is release.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(APP_ENV).map_or(Self::Release, |value| Self::from_app_env(&value))
    }

    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped selector of the physical infrastructure a request touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Live,
    #[default]
    Test,
}

pub const LIVE_KEY_PREFIXES: [&str; 2] = ["sk_live_", "pk_live_"];

impl OperationMode {
    pub const ALL: [Self; 2] = [Self::Live, Self::Test];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Test => "test",
        }
    }

    /// Only an exact `live` (case-insensitive) selects live; everything else is test.
    #[must_use]
    pub fn from_signal(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("live") => Self::Live,
            _ => Self::Test,
        }
    }

    /// Live publishable and secret keys select live.
    #[must_use]
    pub fn from_api_key(key: &str) -> Self {
        if LIVE_KEY_PREFIXES
            .iter()
            .any(|prefix| key.trim().starts_with(prefix))
        {
            Self::Live
        } else {
            Self::Test
        }
    }

    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "test" => Ok(Self::Test),
            other => Err(crate::Error::validation(format!(
                "unknown operation mode: {other}"
            ))),
        }
    }
}
