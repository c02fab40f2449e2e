use super::{Nanotime, Source, Tags};

/// Event priority. Defaults to normal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Returns the wire string, or "" for the default so serializers can
    /// omit the field.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            Priority::Normal => "",
            Priority::Low => "low",
        }
    }
}

/// Event severity. Defaults to info.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlertType {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

impl AlertType {
    /// Returns the wire string, or "" for the default so serializers can
    /// omit the field.
    pub fn as_wire_str(self) -> &'static str {
        match self {
            AlertType::Info => "",
            AlertType::Warning => "warning",
            AlertType::Error => "error",
            AlertType::Success => "success",
        }
    }
}

/// A statsd event. Events are never aggregated; each is forwarded to every
/// backend individually.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub title: String,
    pub text: String,
    /// Unix timestamp (seconds) of when the event happened.
    pub date_happened: i64,
    pub source: Source,
    pub aggregation_key: String,
    pub source_type_name: String,
    pub tags: Tags,
    pub priority: Priority,
    pub alert_type: AlertType,
}

impl Event {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Event {
            title: title.into(),
            text: text.into(),
            date_happened: Nanotime::now().unix_seconds() as i64,
            ..Default::default()
        }
    }

    /// Appends tags and replaces the source. Used by the cloud handler once
    /// instance metadata resolves.
    pub fn add_tags_set_source(&mut self, additional: &Tags, new_source: &Source) {
        self.tags.extend_from(additional);
        self.source = new_source.clone();
    }
}
