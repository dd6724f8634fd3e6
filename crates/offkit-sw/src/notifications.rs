//! Push notifications.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

const DEFAULT_ICON: &str = "data:image/svg+xml,<svg xmlns=\"http://www.w3.org/2000/svg\" \
viewBox=\"0 0 192 192\"><rect fill=\"%2300C853\" width=\"192\" height=\"192\"/><text x=\"96\" \
y=\"110\" font-size=\"120\" font-weight=\"bold\" text-anchor=\"middle\" \
dominant-baseline=\"middle\" fill=\"white\">FR</text></svg>";

/// Fixed presentation for every push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub icon: String,
    pub badge: String,
    /// Deduplication tag. A new notification replaces a shown one with the same tag.
    pub tag: String,
    pub require_interaction: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Field Report".to_string(),
            icon: DEFAULT_ICON.to_string(),
            badge: DEFAULT_ICON.to_string(),
            tag: "field-report-notification".to_string(),
            require_interaction: false,
        }
    }
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
}

impl Notification {
    /// Render a push payload with the configured presentation.
    pub fn from_payload(config: &NotificationConfig, body: &str) -> Self {
        Self {
            title: config.title.clone(),
            body: body.to_string(),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            tag: config.tag.clone(),
            require_interaction: config.require_interaction,
        }
    }
}

/// Notifications currently on screen, one per tag.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: HashMap<String, Notification>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification. Returns true if it replaced one with the same tag.
    pub fn show(&mut self, notification: Notification) -> bool {
        self.shown
            .insert(notification.tag.clone(), notification)
            .is_some()
    }

    /// Close the notification with `tag`.
    pub fn close(&mut self, tag: &str) -> Option<Notification> {
        self.shown.remove(tag)
    }

    pub fn get(&self, tag: &str) -> Option<&Notification> {
        self.shown.get(tag)
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}
