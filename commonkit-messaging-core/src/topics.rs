// commonkit-messaging-core/src/topics.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{MessagingError, Topic};

pub const DEVICE_UPDATE_TOPIC: &str = "device_update_topic";

/// Record bookkeeping shared by persisted models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseModel {
    #[serde(rename = "ID", default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Last known state reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfoCache {
    #[serde(flatten)]
    pub base: BaseModel,
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateTopic {
    #[serde(flatten)]
    pub base: BaseModel,
    pub external_device_id: String,
    pub home_id: String,
    pub user_id: String,
    pub room_id: String,
    pub brand_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub device_info_cache: Option<DeviceInfoCache>,
}

impl Topic for DeviceUpdateTopic {
    fn topic_name(&self) -> &str {
        DEVICE_UPDATE_TOPIC
    }

    fn body(&self) -> Result<Vec<u8>, MessagingError> {
        Ok(serde_json::to_vec(self)?)
    }
}
