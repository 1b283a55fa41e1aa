//! Image roles, formats and object key derivation.
//!
//! An activity record may carry a full screenshot and a thumbnail, each as a
//! base64 payload. Before anything is uploaded the payloads are decoded and
//! assigned a deterministic object key built from the activity and user ids,
//! so a retried record lands on the same object.

use crate::errors::RelayError;
use crate::record::ActivityRecord;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which picture of the activity an image payload is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageRole {
    Screenshot,
    Thumbnail,
}

impl ImageRole {
    pub const ALL: [ImageRole; 2] = [ImageRole::Screenshot, ImageRole::Thumbnail];

    pub const fn key_prefix(&self) -> &'static str {
        match self {
            ImageRole::Screenshot => "screenshots",
            ImageRole::Thumbnail => "thumbnails",
        }
    }

    pub const fn default_format(&self) -> ImageFormat {
        match self {
            ImageRole::Screenshot => ImageFormat::Png,
            ImageRole::Thumbnail => ImageFormat::Jpeg,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ImageRole::Screenshot => "screenshot",
            ImageRole::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub const fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    pub const fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    /// Detects the format from the leading magic bytes of an encoded image.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }
}

/// Builds `<role-prefix>/<activity_uuid>|<user_uid>.<ext>`.
pub fn object_key(
    role: ImageRole,
    activity_uuid: &str,
    user_uid: &str,
    format: ImageFormat,
) -> String {
    format!(
        "{}/{}|{}.{}",
        role.key_prefix(),
        activity_uuid,
        user_uid,
        format.extension()
    )
}

/// Parses a key without re-encoding it, so characters like `|` survive as-is.
pub fn parse_object_key(key: &str) -> Result<ObjectPath, RelayError> {
    ObjectPath::parse(key).map_err(|e| RelayError::InvalidObjectKey {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// A decoded image ready to be uploaded.
#[derive(Clone, Debug)]
pub struct PreparedImage {
    pub role: ImageRole,
    pub format: ImageFormat,
    pub key: ObjectPath,
    pub data: Bytes,
}

/// Splits an optional `data:<mime>;base64,` prefix off a payload.
fn strip_data_url(payload: &str) -> (Option<ImageFormat>, &str) {
    let Some(rest) = payload.strip_prefix("data:") else {
        return (None, payload);
    };
    match rest.split_once(";base64,") {
        Some((mime, data)) => (ImageFormat::from_mime(mime), data),
        None => (None, payload),
    }
}

/// Decodes every image payload on `record` and rewrites the record so it
/// carries object keys instead of bytes.
///
/// Nothing is uploaded here. The returned images must be stored before the
/// rewritten record is published.
pub fn prepare_images(record: &mut ActivityRecord) -> Result<Vec<PreparedImage>, RelayError> {
    let mut prepared = Vec::new();

    for role in ImageRole::ALL {
        let payload = record.image_payload(role).trim();
        if payload.is_empty() {
            // Nothing to upload. A key supplied on its own references an
            // object that already exists.
            record.clear_image_payload(role);
            continue;
        }

        let (mime_format, encoded) = strip_data_url(payload);
        let data = STANDARD
            .decode(encoded)
            .map_err(|source| RelayError::ImageDecode {
                role,
                activity_uuid: record.activity_uuid.clone(),
                source,
            })?;

        let format = record
            .image_format(role)
            .or(mime_format)
            .or_else(|| ImageFormat::sniff(&data))
            .unwrap_or(role.default_format());

        let key = match record.image_key(role) {
            "" => object_key(role, &record.activity_uuid, &record.user_uid, format),
            supplied => supplied.to_string(),
        };
        let path = parse_object_key(&key)?;

        record.set_image_key(role, key, Some(format));

        prepared.push(PreparedImage {
            role,
            format,
            key: path,
            data: Bytes::from(data),
        });
    }

    Ok(prepared)
}
