// PostgREST-style query backend and object storage over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{ChatBackend, MediaStorage, MediaUpload};
use crate::error::BackendError;
use crate::state::{Group, MediaType, MessageRow, Profile};

const REQUEST_TIMEOUT_SECS: u64 = 20;

pub struct RestBackend {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    access_token: Option<String>,
    media_bucket: String,
}

#[derive(Debug, Deserialize)]
struct MembershipRow {
    group_id: String,
}

impl RestBackend {
    pub fn new(
        base_url: &str,
        api_key: String,
        access_token: Option<String>,
        media_bucket: String,
    ) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base,
            api_key,
            access_token: access_token.filter(|t| !t.trim().is_empty()),
            media_bucket,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Transport(format!("bad endpoint {path}: {e}")))
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    /// Public URL of an object in the media bucket.
    fn public_media_url(&self, object_path: &str) -> Result<Url, BackendError> {
        self.endpoint(&format!(
            "storage/v1/object/public/{}/{object_path}",
            self.media_bucket
        ))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let resp = self
            .with_auth(self.http.get(url))
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn insert_row(
        &self,
        body: serde_json::Value,
    ) -> Result<Option<MessageRow>, BackendError> {
        let url = self.endpoint("rest/v1/messages")?;
        let resp = self
            .with_auth(self.http.post(url))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let rows: Vec<MessageRow> = decode(resp).await?;
        Ok(rows.into_iter().next())
    }
}

/// PostgREST `in.(...)` list; ids are quoted so commas inside them cannot split the list.
fn in_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(message));
    }
    Err(BackendError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    let resp = check_status(resp).await?;
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl ChatBackend for RestBackend {
    async fn fetch_group_info(&self, group_id: &str) -> Result<Option<Group>, BackendError> {
        let rows: Vec<Group> = self
            .get_rows(
                "groups",
                &[
                    ("id", format!("eq.{group_id}")),
                    ("select", "id,name,description".into()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_messages(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, BackendError> {
        // Newest first from the server so the limit keeps the latest page.
        let mut rows: Vec<MessageRow> = self
            .get_rows(
                "messages",
                &[
                    ("group_id", format!("eq.{group_id}")),
                    ("order", "created_at.desc".into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn fetch_user_profiles(&self, ids: &[String]) -> Result<Vec<Profile>, BackendError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.get_rows(
            "profiles",
            &[
                ("id", in_list(ids)),
                ("select", "id,username,avatar_url".into()),
            ],
        )
        .await
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<Profile, BackendError> {
        let rows: Vec<Profile> = self
            .get_rows(
                "profiles",
                &[
                    ("id", format!("eq.{user_id}")),
                    ("select", "id,username,avatar_url".into()),
                ],
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }

    async fn fetch_memberships(&self, user_id: &str) -> Result<Vec<Group>, BackendError> {
        let memberships: Vec<MembershipRow> = self
            .get_rows(
                "group_members",
                &[
                    ("user_id", format!("eq.{user_id}")),
                    ("select", "group_id".into()),
                ],
            )
            .await?;
        if memberships.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<String> = memberships.into_iter().map(|m| m.group_id).collect();
        self.get_rows(
            "groups",
            &[
                ("id", in_list(&ids)),
                ("select", "id,name,description".into()),
                ("order", "name.asc".into()),
            ],
        )
        .await
    }

    async fn persist_text_message(
        &self,
        group_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<Option<MessageRow>, BackendError> {
        self.insert_row(serde_json::json!({
            "group_id": group_id,
            "user_id": user_id,
            "content": content,
        }))
        .await
    }

    async fn persist_media_message(
        &self,
        group_id: &str,
        user_id: &str,
        url: &str,
        media_type: MediaType,
    ) -> Result<Option<MessageRow>, BackendError> {
        self.insert_row(serde_json::json!({
            "group_id": group_id,
            "user_id": user_id,
            "content": "",
            "media_url": url,
            "media_type": media_type,
        }))
        .await
    }
}

#[async_trait]
impl MediaStorage for RestBackend {
    async fn upload_media(
        &self,
        upload: MediaUpload,
        owner_id: &str,
    ) -> Result<String, BackendError> {
        let object_path = format!(
            "{owner_id}/{}/{}.{}",
            upload.media_type,
            uuid::Uuid::new_v4(),
            upload.extension()
        );
        let url = self.endpoint(&format!(
            "storage/v1/object/{}/{object_path}",
            self.media_bucket
        ))?;
        let content_type = upload.content_type().to_string();
        let resp = self
            .with_auth(self.http.post(url))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(upload.bytes)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(self.public_media_url(&object_path)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash_so_joins_keep_prefix() {
        let backend = RestBackend::new(
            "https://example.test/project",
            "anon".into(),
            None,
            "media".into(),
        )
        .expect("backend");
        let url = backend.endpoint("rest/v1/messages").expect("endpoint");
        assert_eq!(url.as_str(), "https://example.test/project/rest/v1/messages");
    }

    #[test]
    fn public_media_url_points_into_bucket() {
        let backend =
            RestBackend::new("https://example.test", "anon".into(), None, "chat-media".into())
                .expect("backend");
        let url = backend.public_media_url("u1/image/x.png").expect("url");
        assert_eq!(
            url.as_str(),
            "https://example.test/storage/v1/object/public/chat-media/u1/image/x.png"
        );
    }

    #[test]
    fn in_list_quotes_every_id() {
        let ids = vec!["a".to_string(), "b,c".to_string()];
        assert_eq!(in_list(&ids), "in.(\"a\",\"b,c\")");
    }

    #[test]
    fn blank_access_token_is_ignored() {
        let backend =
            RestBackend::new("https://example.test", "anon".into(), Some("  ".into()), "m".into())
                .expect("backend");
        assert!(backend.access_token.is_none());
    }
}
