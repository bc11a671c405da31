//! Image and embedding records.
//!
//! The embedding record is the unit persisted to blob storage and folded into
//! the index by an incremental update:
//!
//! ```json
//! {
//!   "id": "01jc...",
//!   "embedding": [0.1, ...],
//!   "metadata": {"image_path": "...", "user_type": "admin", "user_id": null, "created_at": "..."},
//!   "restricts": [{"namespace": "user_type", "allow": ["admin"]}]
//! }
//! ```
//!
//! `restricts` carries the owner fields in the index's filtering format so
//! queries can filter on them and neighbors can be traced back to an image.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eid::Eid;
use crate::storage::BlobUri;

pub const RESTRICT_IMAGE_PATH: &str = "image_path";
pub const RESTRICT_USER_TYPE: &str = "user_type";
pub const RESTRICT_USER_ID: &str = "user_id";

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record {id} has an empty embedding")]
    EmptyEmbedding { id: String },

    #[error("record {id} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    #[error("record {id} contains a non-finite value")]
    NonFinite { id: String },

    #[error("user records need a user id")]
    MissingUserId,

    #[error("unknown owner class '{0}', expected 'admin' or 'user'")]
    UnknownOwnerClass(String),
}

/// Who an image belongs to. Decides the storage namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Admin,
    User(String),
}

impl Owner {
    pub fn from_parts(user_type: &str, user_id: Option<&str>) -> Result<Self, RecordError> {
        match user_type.to_lowercase().as_str() {
            "admin" => Ok(Owner::Admin),
            "user" => match user_id.map(str::trim).filter(|id| !id.is_empty()) {
                Some(id) => Ok(Owner::User(id.to_string())),
                None => Err(RecordError::MissingUserId),
            },
            other => Err(RecordError::UnknownOwnerClass(other.to_string())),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Owner::Admin => "admin",
            Owner::User(_) => "user",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Owner::Admin => None,
            Owner::User(id) => Some(id),
        }
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Admin => write!(f, "admin"),
            Owner::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Owner {
    type Err = RecordError;

    /// `admin` or `user:{id}`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((class, id)) => Owner::from_parts(class, Some(id)),
            None => Owner::from_parts(s, None),
        }
    }
}

/// An image stored under its owner's namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub uri: BlobUri,
    /// Local file the image was uploaded from, if it came from disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    /// Hex SHA-256 of the uploaded bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub user_type: String,
    pub user_id: Option<String>,
}

impl ImageRecord {
    pub fn owner(&self) -> Result<Owner, RecordError> {
        Owner::from_parts(&self.user_type, self.user_id.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Bucket-relative path of the source image.
    pub image_path: String,
    pub user_type: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Token restriction in the index's filtering format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrict {
    pub namespace: String,
    pub allow: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Eid,
    pub embedding: Vec<f32>,
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub restricts: Vec<Restrict>,
}

impl EmbeddingRecord {
    pub fn new(
        embedding: Vec<f32>,
        image_path: &str,
        owner: &Owner,
        created_at: DateTime<Utc>,
    ) -> Self {
        let metadata = RecordMetadata {
            image_path: image_path.to_string(),
            user_type: owner.class().to_string(),
            user_id: owner.user_id().map(str::to_string),
            created_at,
        };

        let mut restricts = vec![
            Restrict {
                namespace: RESTRICT_USER_TYPE.to_string(),
                allow: vec![metadata.user_type.clone()],
            },
            Restrict {
                namespace: RESTRICT_IMAGE_PATH.to_string(),
                allow: vec![metadata.image_path.clone()],
            },
        ];
        if let Some(user_id) = &metadata.user_id {
            restricts.push(Restrict {
                namespace: RESTRICT_USER_ID.to_string(),
                allow: vec![user_id.clone()],
            });
        }

        Self {
            id: Eid::new(),
            embedding,
            metadata,
            restricts,
        }
    }

    /// Checks the embedding against the dimension the index is bound to.
    pub fn validate(&self, expected_dimension: Option<usize>) -> Result<(), RecordError> {
        if self.embedding.is_empty() {
            return Err(RecordError::EmptyEmbedding {
                id: self.id.to_string(),
            });
        }
        if let Some(expected) = expected_dimension {
            if self.embedding.len() != expected {
                return Err(RecordError::DimensionMismatch {
                    id: self.id.to_string(),
                    expected,
                    got: self.embedding.len(),
                });
            }
        }
        if self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(RecordError::NonFinite {
                id: self.id.to_string(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self, expected_dimension: Option<usize>) -> Result<Vec<u8>, RecordError> {
        self.validate(expected_dimension)?;
        Ok(serde_json::to_vec(self)?)
    }

    #[cfg(test)]
    pub fn from_json(data: &[u8], expected_dimension: Option<usize>) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_slice(data)?;
        record.validate(expected_dimension)?;
        Ok(record)
    }
}

/// Metadata recovered from a neighbor's restricts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborMetadata {
    pub image_path: Option<String>,
    pub user_type: Option<String>,
    pub user_id: Option<String>,
}

impl NeighborMetadata {
    pub fn from_restricts(restricts: &[Restrict]) -> Option<Self> {
        let first = |namespace: &str| {
            restricts
                .iter()
                .find(|r| r.namespace == namespace)
                .and_then(|r| r.allow.first().cloned())
        };

        let metadata = Self {
            image_path: first(RESTRICT_IMAGE_PATH),
            user_type: first(RESTRICT_USER_TYPE),
            user_id: first(RESTRICT_USER_ID),
        };

        if metadata == Self::default() {
            None
        } else {
            Some(metadata)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 7, 9, 6, 12).unwrap()
    }

    #[test]
    fn test_owner_parsing() {
        assert_eq!("admin".parse::<Owner>().unwrap(), Owner::Admin);
        assert_eq!(
            "user:42".parse::<Owner>().unwrap(),
            Owner::User("42".to_string())
        );
        assert!(matches!(
            "user".parse::<Owner>(),
            Err(RecordError::MissingUserId)
        ));
        assert!(matches!(
            "guest".parse::<Owner>(),
            Err(RecordError::UnknownOwnerClass(_))
        ));
    }

    #[test]
    fn test_record_json_roundtrip_preserves_vector() {
        let embedding = vec![0.25, -1.5, 3.125e-3, 0.0];
        let record = EmbeddingRecord::new(
            embedding.clone(),
            "images/users/7/a.png",
            &Owner::User("7".to_string()),
            created_at(),
        );

        let json = record.to_json(Some(4)).unwrap();
        let back = EmbeddingRecord::from_json(&json, Some(4)).unwrap();

        assert_eq!(back.id, record.id);
        assert_eq!(back.embedding.len(), embedding.len());
        for (a, b) in back.embedding.iter().zip(&embedding) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(back.metadata, record.metadata);
    }

    #[test]
    fn test_record_json_layout() {
        let record = EmbeddingRecord::new(vec![1.0], "images/admin/a.png", &Owner::Admin, created_at());
        let value: serde_json::Value = serde_json::from_slice(&record.to_json(None).unwrap()).unwrap();

        assert!(value["id"].is_string());
        assert_eq!(value["embedding"], serde_json::json!([1.0]));
        assert_eq!(value["metadata"]["image_path"], "images/admin/a.png");
        assert_eq!(value["metadata"]["user_type"], "admin");
        assert!(value["metadata"]["user_id"].is_null());
        assert_eq!(value["metadata"]["created_at"], "2024-11-07T09:06:12Z");
    }

    #[test]
    fn test_dimension_is_validated_at_boundaries() {
        let record = EmbeddingRecord::new(vec![1.0, 2.0], "p", &Owner::Admin, created_at());
        assert!(matches!(
            record.to_json(Some(3)),
            Err(RecordError::DimensionMismatch { expected: 3, got: 2, .. })
        ));

        let json = record.to_json(None).unwrap();
        assert!(EmbeddingRecord::from_json(&json, Some(3)).is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let record = EmbeddingRecord::new(vec![f32::NAN], "p", &Owner::Admin, created_at());
        assert!(matches!(
            record.validate(None),
            Err(RecordError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_metadata_from_restricts() {
        let record = EmbeddingRecord::new(
            vec![1.0],
            "images/users/9/x.jpg",
            &Owner::User("9".to_string()),
            created_at(),
        );
        let metadata = NeighborMetadata::from_restricts(&record.restricts).unwrap();
        assert_eq!(metadata.image_path.as_deref(), Some("images/users/9/x.jpg"));
        assert_eq!(metadata.user_type.as_deref(), Some("user"));
        assert_eq!(metadata.user_id.as_deref(), Some("9"));

        assert!(NeighborMetadata::from_restricts(&[]).is_none());
    }
}
