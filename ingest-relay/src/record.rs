use crate::images::{ImageFormat, ImageRole};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};

/// One activity sample reported by the desktop agent.
///
/// Field names are the wire contract shared with the agent, the queue
/// consumers and the `user_activity` table. Missing and `null` fields take
/// their zero value; a field of the wrong JSON type fails the decode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub activity_uuid: String,
    #[serde(alias = "user_id", deserialize_with = "null_as_default")]
    pub user_uid: String,
    #[serde(deserialize_with = "null_as_default")]
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<FixedOffset>>,
    #[serde(deserialize_with = "null_as_default")]
    pub app_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub page_title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub productivity_status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub meridian: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ip_address: String,
    #[serde(deserialize_with = "null_as_default")]
    pub mac_address: String,
    #[serde(deserialize_with = "null_as_default")]
    pub mouse_movement: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub mouse_clicks: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub keys_clicks: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub status: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub cpu_usage: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ram_usage: String,

    /// Base64 screenshot payload; always empty once the record is rewritten
    #[serde(deserialize_with = "null_as_default")]
    pub screenshot: String,
    #[serde(deserialize_with = "null_as_default")]
    pub screenshot_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_format: Option<ImageFormat>,

    /// Base64 thumbnail payload; always empty once the record is rewritten
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnail: String,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnail_uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_format: Option<ImageFormat>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ActivityRecord {
    pub fn image_payload(&self, role: ImageRole) -> &str {
        match role {
            ImageRole::Screenshot => &self.screenshot,
            ImageRole::Thumbnail => &self.thumbnail,
        }
    }

    pub fn image_key(&self, role: ImageRole) -> &str {
        match role {
            ImageRole::Screenshot => &self.screenshot_uid,
            ImageRole::Thumbnail => &self.thumbnail_uid,
        }
    }

    pub fn image_format(&self, role: ImageRole) -> Option<ImageFormat> {
        match role {
            ImageRole::Screenshot => self.screenshot_format,
            ImageRole::Thumbnail => self.thumbnail_format,
        }
    }

    pub fn has_image_payload(&self) -> bool {
        ImageRole::ALL
            .iter()
            .any(|role| !self.image_payload(*role).trim().is_empty())
    }

    pub fn clear_image_payload(&mut self, role: ImageRole) {
        match role {
            ImageRole::Screenshot => self.screenshot.clear(),
            ImageRole::Thumbnail => self.thumbnail.clear(),
        }
    }

    /// Replaces the image payload of `role` with its object key.
    pub fn set_image_key(&mut self, role: ImageRole, key: String, format: Option<ImageFormat>) {
        self.clear_image_payload(role);
        match role {
            ImageRole::Screenshot => {
                self.screenshot_uid = key;
                self.screenshot_format = format;
            }
            ImageRole::Thumbnail => {
                self.thumbnail_uid = key;
                self.thumbnail_format = format;
            }
        }
    }

    /// Object keys referenced by this record.
    pub fn object_keys(&self) -> impl Iterator<Item = &str> {
        ImageRole::ALL
            .into_iter()
            .map(|role| self.image_key(role))
            .filter(|key| !key.is_empty())
    }

    /// Checks the fields the image keys are derived from.
    pub fn validate(&self) -> Result<(), String> {
        if !self.has_image_payload() {
            return Ok(());
        }
        for (name, value) in [
            ("activity_uuid", &self.activity_uuid),
            ("user_uid", &self.user_uid),
        ] {
            if value.is_empty() {
                return Err(format!("{name} is required when an image is attached"));
            }
            if value.contains('/') {
                return Err(format!("{name} must not contain '/'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_agent_payload() {
        let json = r#"{
            "activity_uuid": "a1",
            "user_uid": "u1",
            "organization_id": "org",
            "timestamp": "2024-03-01T09:15:00+02:00",
            "app_name": "Code",
            "url": "https://example.com",
            "page_title": "main.rs",
            "productivity_status": "productive",
            "meridian": "AM",
            "ip_address": "10.0.0.2",
            "mac_address": "aa:bb:cc:dd:ee:ff",
            "mouse_movement": true,
            "mouse_clicks": 12,
            "keys_clicks": 340,
            "status": 1,
            "cpu_usage": "12.5%",
            "ram_usage": "3.1GB"
        }"#;

        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.activity_uuid, "a1");
        assert_eq!(record.user_uid, "u1");
        assert_eq!(record.mouse_clicks, 12);
        assert_eq!(record.keys_clicks, 340);
        assert!(record.mouse_movement);
        assert_eq!(
            record.timestamp.unwrap().to_rfc3339(),
            "2024-03-01T09:15:00+02:00"
        );
        assert!(!record.has_image_payload());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_user_id_alias() {
        let record: ActivityRecord =
            serde_json::from_str(r#"{"activity_uuid":"a1","user_id":"u1"}"#).unwrap();
        assert_eq!(record.user_uid, "u1");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["user_uid"], "u1");
        assert!(value.get("user_id").is_none());
        assert!(value.get("timestamp").is_none());
        assert_eq!(value["screenshot"], "");
    }

    #[test]
    fn test_null_fields_take_defaults() {
        let record: ActivityRecord = serde_json::from_str(
            r#"{"activity_uuid":"a1","user_id":null,"app_name":null,"mouse_clicks":null,
                "mouse_movement":null,"timestamp":null,"screenshot":null}"#,
        )
        .unwrap();
        assert_eq!(record.activity_uuid, "a1");
        assert_eq!(record.user_uid, "");
        assert_eq!(record.app_name, "");
        assert_eq!(record.mouse_clicks, 0);
        assert!(!record.mouse_movement);
        assert!(record.timestamp.is_none());
        assert!(!record.has_image_payload());
    }

    #[test]
    fn test_wrong_type_fails() {
        assert!(serde_json::from_str::<ActivityRecord>(r#"{"mouse_clicks":"many"}"#).is_err());
        assert!(serde_json::from_str::<ActivityRecord>(r#"{"timestamp":"yesterday"}"#).is_err());
    }

    #[test]
    fn test_set_image_key() {
        let mut record = ActivityRecord {
            screenshot: "aGVsbG8=".into(),
            ..Default::default()
        };
        record.set_image_key(
            ImageRole::Screenshot,
            "screenshots/a|u.png".into(),
            Some(ImageFormat::Png),
        );
        assert!(record.screenshot.is_empty());
        assert_eq!(
            record.object_keys().collect::<Vec<_>>(),
            vec!["screenshots/a|u.png"]
        );
    }

    #[test]
    fn test_validate() {
        let mut record = ActivityRecord {
            thumbnail: "aGVsbG8=".into(),
            ..Default::default()
        };
        assert!(record.validate().is_err());

        record.activity_uuid = "a1".into();
        record.user_uid = "team/u1".into();
        assert!(record.validate().is_err());

        record.user_uid = "u1".into();
        assert!(record.validate().is_ok());
    }
}
