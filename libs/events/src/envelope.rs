//! The system event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_id::AppId;

use crate::EventKind;

/// The resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceRef {
    Service {
        app_id: AppId,
        service_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Image {
        name: String,
    },
    Network {
        app_id: AppId,
        name: String,
    },
    Volume {
        app_id: AppId,
        name: String,
    },
    App {
        app_id: AppId,
    },
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceRef::Service {
                app_id,
                service_name,
                image: Some(image),
            } => write!(f, "service {service_name} ({image}) of app {app_id}"),
            ResourceRef::Service {
                app_id,
                service_name,
                image: None,
            } => write!(f, "service {service_name} of app {app_id}"),
            ResourceRef::Image { name } => write!(f, "image {name}"),
            ResourceRef::Network { app_id, name } => write!(f, "network {name} of app {app_id}"),
            ResourceRef::Volume { app_id, name } => write!(f, "volume {name} of app {app_id}"),
            ResourceRef::App { app_id } => write!(f, "app {app_id}"),
        }
    }
}

/// One structured system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,

    /// Error message, for failure kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub emitted_at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            resource: None,
            error: None,
            emitted_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: ResourceRef) -> Self {
        self.resource = Some(resource);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
