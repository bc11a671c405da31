//! Object namespace layout.
//!
//! ```text
//! images/admin/{filename}
//! images/users/{user_id}/{filename}
//! embeddings/{YYYYMM}/{record_id}.json
//! ```

use chrono::{DateTime, Utc};

use crate::eid::Eid;
use crate::records::Owner;

pub const IMAGES_ROOT: &str = "images";
pub const EMBEDDINGS_ROOT: &str = "embeddings";

/// Prefix (with trailing slash) under which an owner's images live.
pub fn owner_prefix(owner: &Owner) -> String {
    match owner {
        Owner::Admin => format!("{IMAGES_ROOT}/admin/"),
        Owner::User(user_id) => format!("{IMAGES_ROOT}/users/{user_id}/"),
    }
}

pub fn image_path(owner: &Owner, filename: &str) -> String {
    format!("{}{filename}", owner_prefix(owner))
}

/// Per-month folder that one incremental index update is pointed at.
pub fn embeddings_prefix(at: DateTime<Utc>) -> String {
    format!("{EMBEDDINGS_ROOT}/{}", at.format("%Y%m"))
}

pub fn embedding_record_path(prefix: &str, id: &Eid) -> String {
    format!("{}/{id}.json", prefix.trim_end_matches('/'))
}
