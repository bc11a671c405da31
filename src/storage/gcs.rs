use serde::Deserialize;
use url::Url;

use super::{validate_path, BlobStore, BlobUri, StorageError};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Cloud Storage JSON API client.
pub struct GcsBlobStore {
    bucket: String,
    endpoint: String,
    access_token: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectResource {
    name: String,
}

impl GcsBlobStore {
    pub fn new(bucket: &str, endpoint: Option<&str>, access_token: &str) -> Self {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
        GcsBlobStore {
            bucket: bucket.to_string(),
            endpoint: endpoint.strip_suffix('/').unwrap_or(endpoint).to_string(),
            access_token: access_token.to_string(),
            client: reqwest::blocking::Client::new(),
        }
    }

    /// `{endpoint}/{api}/storage/v1/b/{bucket}/o[/{object}]`, with the object
    /// name encoded as a single segment.
    fn object_url(&self, api: Option<&str>, object: Option<&str>) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| StorageError::InvalidUri(format!("{}: {e}", self.endpoint)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::InvalidUri(self.endpoint.clone()))?;
            if let Some(api) = api {
                segments.push(api);
            }
            segments.extend(["storage", "v1", "b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                segments.push(object);
            }
        }
        Ok(url)
    }

    fn check(
        &self,
        response: reqwest::blocking::Response,
        path: &str,
    ) -> Result<reqwest::blocking::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(self.uri(path).to_string()));
        }

        let message = response.text().unwrap_or_default();
        log::debug!("gcs {status} for {path}: {message}");
        Err(StorageError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

impl BlobStore for GcsBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(
        &self,
        path: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<BlobUri, StorageError> {
        validate_path(path)?;
        let url = self.object_url(Some("upload"), None)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "media"), ("name", path)])
            .header(
                reqwest::header::CONTENT_TYPE,
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(data.to_vec())
            .send()?;
        self.check(response, path)?;

        Ok(self.uri(path))
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_path(path)?;
        let url = self.object_url(None, Some(path))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&[("alt", "media")])
            .send()?;
        let response = self.check(response, path)?;

        Ok(response.bytes()?.to_vec())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let url = self.object_url(None, None)?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(url.clone())
                .bearer_auth(&self.access_token)
                .query(&[("prefix", prefix)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = self.check(request.send()?, prefix)?;
            let page: ListResponse = response.json()?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        let url = self.object_url(None, Some(path))?;

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()?;
        self.check(response, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_encodes_name_as_one_segment() {
        let store = GcsBlobStore::new("sisterly", None, "token");
        let url = store
            .object_url(None, Some("images/admin/a b.png"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/sisterly/o/images%2Fadmin%2Fa%20b.png"
        );
    }

    #[test]
    fn test_upload_url_uses_upload_api() {
        let store = GcsBlobStore::new("sisterly", Some("http://localhost:4443/"), "token");
        let url = store.object_url(Some("upload"), None).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:4443/upload/storage/v1/b/sisterly/o"
        );
    }
}
