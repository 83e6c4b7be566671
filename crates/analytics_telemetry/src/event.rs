//! Event inputs and the canonical event record.

use analytics_store::{EventRow, EventType};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::environment::{DeviceInfo, Environment};
use crate::geo::GeoData;

/// Longest element text kept on a click event.
pub const MAX_ELEMENT_TEXT: usize = 100;

/// Pointer coordinates at the time of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MousePosition {
    pub x: i32,
    pub y: i32,
}

/// Argument of [`Tracker::track_event`](crate::Tracker::track_event).
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
    pub event_type: EventType,
    pub event_name: String,
    /// Overrides the current path when set
    pub page_url: Option<String>,
    pub properties: Map<String, Value>,
    pub element_id: Option<String>,
    pub element_type: Option<String>,
    pub element_text: Option<String>,
    pub scroll_depth: Option<u8>,
    /// Seconds
    pub time_on_page: Option<u64>,
    pub mouse_position: Option<MousePosition>,
}

impl TrackedEvent {
    pub fn new(event_type: EventType, event_name: &str) -> Self {
        Self {
            event_type,
            event_name: event_name.to_string(),
            page_url: None,
            properties: Map::new(),
            element_id: None,
            element_type: None,
            element_text: None,
            scroll_depth: None,
            time_on_page: None,
            mouse_position: None,
        }
    }

    /// A `custom` event.
    pub fn custom(event_name: &str) -> Self {
        Self::new(EventType::Custom, event_name)
    }

    pub fn with_page_url(mut self, page_url: &str) -> Self {
        self.page_url = Some(page_url.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_scroll_depth(mut self, depth: u8) -> Self {
        self.scroll_depth = Some(depth);
        self
    }

    pub fn with_time_on_page(mut self, seconds: u64) -> Self {
        self.time_on_page = Some(seconds);
        self
    }

    pub fn with_mouse_position(mut self, x: i32, y: i32) -> Self {
        self.mouse_position = Some(MousePosition { x, y });
        self
    }

    /// Copy element metadata onto the event.
    pub fn with_element(mut self, element: &ElementInfo) -> Self {
        self.element_id = element.id.clone();
        self.element_type = Some(element.tag.clone());
        self.element_text = element.text.clone();
        if let Some(class_name) = &element.class_name {
            self.properties.insert("element_class".to_string(), class_name.clone().into());
        }
        if let Some(href) = &element.href {
            self.properties.insert("href".to_string(), href.clone().into());
        }
        if let Some(value) = &element.value {
            self.properties.insert("element_value".to_string(), value.clone().into());
        }
        self
    }

    /// Compose the canonical record.
    pub(crate) fn into_row(self, context: &EventContext<'_>) -> EventRow {
        let mut properties = self.properties;
        let mut put = |key: &str, value: Value| {
            properties.insert(key.to_string(), value);
        };

        if let Some(id) = self.element_id {
            put("element_id", id.into());
        }
        if let Some(kind) = self.element_type {
            put("element_type", kind.into());
        }
        if let Some(text) = self.element_text {
            put("element_text", text.into());
        }
        if let Some(depth) = self.scroll_depth {
            put("scroll_depth", depth.into());
        }
        if let Some(seconds) = self.time_on_page {
            put("time_on_page", seconds.into());
        }
        if let Some(position) = self.mouse_position {
            put("mouse_x", position.x.into());
            put("mouse_y", position.y.into());
        }
        put("screen_resolution", context.device.screen_resolution.clone().into());
        put("viewport_size", context.device.viewport_size.clone().into());
        put("language", context.device.language.clone().into());
        put(
            "timestamp",
            context.now.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
        );

        EventRow {
            id: Uuid::new_v4().to_string(),
            event_type: self.event_type,
            event_name: self.event_name,
            page_url: self.page_url.unwrap_or_else(|| context.current_path.to_string()),
            referrer: context.environment.referrer.clone(),
            session_id: context.session_id.to_string(),
            user_agent: context.environment.user_agent.clone(),
            country: Some(context.geo.country.clone()),
            city: Some(context.geo.city.clone()),
            device_type: context.device.device_type,
            browser: context.device.browser.clone(),
            os: context.device.os.clone(),
            properties,
            created_at: context.now,
        }
    }
}

/// Everything an event is enriched with at capture time.
#[derive(Debug)]
pub(crate) struct EventContext<'a> {
    pub session_id: &'a str,
    pub current_path: &'a str,
    pub environment: &'a Environment,
    pub device: &'a DeviceInfo,
    pub geo: &'a GeoData,
    pub now: DateTime<Utc>,
}

/// Metadata of a clicked DOM element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub id: Option<String>,
    /// Lowercase tag name, e.g. `button`
    pub tag: String,
    pub text: Option<String>,
    pub class_name: Option<String>,
    pub href: Option<String>,
    pub value: Option<String>,
}

impl ElementInfo {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Whitespace is collapsed and the text cut to [`MAX_ELEMENT_TEXT`] chars.
    pub fn with_text(mut self, text: &str) -> Self {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        self.text = (!collapsed.is_empty())
            .then(|| collapsed.chars().take(MAX_ELEMENT_TEXT).collect());
        self
    }

    pub fn with_class(mut self, class_name: &str) -> Self {
        self.class_name = Some(class_name.to_string());
        self
    }

    pub fn with_href(mut self, href: &str) -> Self {
        self.href = Some(href.to_string());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    /// Human label: text, else id, else tag.
    pub fn label(&self) -> &str {
        self.text
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or(&self.tag)
    }
}

/// What happened to a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormAction {
    Focus,
    Change,
    Submit,
}

impl FormAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormAction::Focus => "focus",
            FormAction::Change => "change",
            FormAction::Submit => "submit",
        }
    }
}

/// Shape of a form; never its values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormInfo {
    pub id: Option<String>,
    pub field_names: Vec<String>,
    pub method: String,
    pub action: String,
}

impl FormInfo {
    pub fn new(method: &str, action: &str) -> Self {
        Self {
            id: None,
            field_names: Vec::new(),
            method: method.to_ascii_uppercase(),
            action: action.to_string(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_field(mut self, name: &str) -> Self {
        self.field_names.push(name.to_string());
        self
    }
}
