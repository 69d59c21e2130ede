use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

pub trait QueuePayload: Serialize + Clone + Send + Sync + 'static {
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }
}

impl QueuePayload for Value {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.is_null() {
            return Err(PayloadError("payload cannot be null".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    #[default]
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl Classification {
    pub fn default_priority(self) -> i32 {
        match self {
            Classification::TopSecret | Classification::Secret => 10,
            Classification::Confidential => 5,
            Classification::Unclassified => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropertyTransfer {
    pub item_id: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    pub from_unit: String,
    pub to_unit: String,
    pub actor: String,
    #[serde(default)]
    pub classification: Classification,
    pub requested_at: DateTime<Utc>,
}

impl QueuePayload for PropertyTransfer {
    fn validate(&self) -> Result<(), PayloadError> {
        for (field, value) in [
            ("item_id", &self.item_id),
            ("from_unit", &self.from_unit),
            ("to_unit", &self.to_unit),
            ("actor", &self.actor),
        ] {
            if value.trim().is_empty() {
                return Err(PayloadError(format!("{field} cannot be empty")));
            }
        }
        if self.from_unit == self.to_unit {
            return Err(PayloadError(
                "from_unit and to_unit must differ".to_string(),
            ));
        }
        Ok(())
    }
}
