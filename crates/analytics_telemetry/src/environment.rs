//! Environment fingerprinting: device class, browser, OS and display metrics.

use analytics_store::DeviceType;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const TABLET_PATTERN: &str = r"(?i)tablet|ipad|playbook|silk";
const MOBILE_PATTERN: &str =
    r"(?i)mobile|iphone|ipod|android|blackberry|iemobile|kindle|opera mini|opera mobi|webos";

/// Ordered browser tests; the first substring found wins.
const BROWSERS: &[(&str, &str)] = &[
    ("Firefox", "Firefox"),
    ("Chrome", "Chrome"),
    ("Safari", "Safari"),
    ("Edge", "Edge"),
    ("Opera", "Opera"),
];

/// Ordered OS tests; the first substring found wins.
const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Mac", "macOS"),
    ("Linux", "Linux"),
    ("Android", "Android"),
    ("iOS", "iOS"),
];

const UNKNOWN: &str = "Unknown";

/// Ambient state of the browsing context, as reported by the host page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub user_agent: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub color_depth: u8,
    pub language: String,
    pub cookie_enabled: bool,
    pub online: bool,
    /// `document.referrer`; `None` for direct visits
    pub referrer: Option<String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            screen_width: 0,
            screen_height: 0,
            viewport_width: 0,
            viewport_height: 0,
            color_depth: 24,
            language: "en-US".to_string(),
            cookie_enabled: true,
            online: true,
            referrer: None,
        }
    }
}

impl Environment {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            ..Default::default()
        }
    }

    pub fn with_screen(mut self, width: u32, height: u32) -> Self {
        self.screen_width = width;
        self.screen_height = height;
        self
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport_width = width;
        self.viewport_height = height;
        self
    }

    pub fn with_referrer(mut self, referrer: &str) -> Self {
        self.referrer = (!referrer.is_empty()).then(|| referrer.to_string());
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }
}

/// Device fingerprint attached to every event and session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
    /// `"<width>x<height>"`
    pub screen_resolution: String,
    /// `"<width>x<height>"`
    pub viewport_size: String,
    pub color_depth: u8,
    pub language: String,
    pub cookie_enabled: bool,
    pub online_status: bool,
}

impl DeviceInfo {
    /// Derive the fingerprint from the environment. Pure.
    pub fn resolve(env: &Environment) -> Self {
        Self {
            device_type: classify_device(&env.user_agent),
            browser: classify_browser(&env.user_agent).to_string(),
            os: classify_os(&env.user_agent).to_string(),
            screen_resolution: format!("{}x{}", env.screen_width, env.screen_height),
            viewport_size: format!("{}x{}", env.viewport_width, env.viewport_height),
            color_depth: env.color_depth,
            language: env.language.clone(),
            cookie_enabled: env.cookie_enabled,
            online_status: env.online,
        }
    }
}

/// Tablet patterns are tested before mobile ones; everything else is desktop.
pub fn classify_device(user_agent: &str) -> DeviceType {
    if is_tablet(user_agent) {
        DeviceType::Tablet
    } else if matches(mobile_regex(), user_agent) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

pub fn classify_browser(user_agent: &str) -> &'static str {
    first_match(BROWSERS, user_agent)
}

pub fn classify_os(user_agent: &str) -> &'static str {
    first_match(OPERATING_SYSTEMS, user_agent)
}

fn is_tablet(user_agent: &str) -> bool {
    if matches(tablet_regex(), user_agent) {
        return true;
    }
    // Android tablets omit the "Mobi" token.
    let lower = user_agent.to_ascii_lowercase();
    lower.contains("android") && !lower.contains("mobi")
}

fn first_match(table: &[(&str, &'static str)], user_agent: &str) -> &'static str {
    table
        .iter()
        .find(|(needle, _)| user_agent.contains(needle))
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN)
}

fn matches(regex: Option<&Regex>, haystack: &str) -> bool {
    regex.is_some_and(|re| re.is_match(haystack))
}

fn tablet_regex() -> Option<&'static Regex> {
    static TABLET: OnceLock<Option<Regex>> = OnceLock::new();
    TABLET.get_or_init(|| Regex::new(TABLET_PATTERN).ok()).as_ref()
}

fn mobile_regex() -> Option<&'static Regex> {
    static MOBILE: OnceLock<Option<Regex>> = OnceLock::new();
    MOBILE.get_or_init(|| Regex::new(MOBILE_PATTERN).ok()).as_ref()
}
