use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{ApiClient, ApiError, ChatsPage};
use crate::core::entities::{CountryCode, Message, PhotoRef, User};
use crate::core::ids::{ChatId, CorrelationId, MessageId, UserId};
use crate::utils::url::{chat_endpoint, construct_api_url, encode_path_segment};

/// [`ApiClient`] over JSON REST endpoints below `base_url`.
#[derive(Clone)]
pub struct HttpApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApiClient {
    pub fn new(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self.authorize(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            debug!(status = status.as_u16(), "API request failed");
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    fn user_endpoint(&self, user_id: &UserId, resource: &str) -> String {
        construct_api_url(
            &self.base_url,
            &format!("users/{}/{}", encode_path_segment(user_id.as_str()), resource),
        )
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn load_chats(&self) -> Result<ChatsPage, ApiError> {
        let url = construct_api_url(&self.base_url, "chats");
        self.send_json(self.client.get(url)).await
    }

    async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        correlation: CorrelationId,
    ) -> Result<Message, ApiError> {
        let url = chat_endpoint(&self.base_url, chat_id.as_str(), "messages");
        let body = json!({ "text": text, "clientId": correlation });
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn delete_messages(
        &self,
        chat_id: &ChatId,
        message_ids: &[MessageId],
    ) -> Result<(), ApiError> {
        let url = chat_endpoint(&self.base_url, chat_id.as_str(), "messages/delete");
        let body = json!({ "messageIds": message_ids });
        self.send(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn pin_message(
        &self,
        chat_id: &ChatId,
        message_id: MessageId,
        is_pinned: bool,
    ) -> Result<(), ApiError> {
        let resource = format!(
            "messages/{}/pin",
            encode_path_segment(&message_id.to_string())
        );
        let url = chat_endpoint(&self.base_url, chat_id.as_str(), &resource);
        let body = json!({ "isPinned": is_pinned });
        self.send(self.client.post(url).json(&body)).await?;
        Ok(())
    }

    async fn update_contact(&self, user: &User) -> Result<User, ApiError> {
        let url = self.user_endpoint(&user.id, "contact");
        let body = json!({ "firstName": user.first_name, "lastName": user.last_name });
        self.send_json(self.client.put(url).json(&body)).await
    }

    async fn upload_profile_photo(
        &self,
        user_id: &UserId,
        file_name: &str,
    ) -> Result<PhotoRef, ApiError> {
        let url = self.user_endpoint(user_id, "photo");
        let body = json!({ "fileName": file_name });
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn fetch_country_list(&self, language: &str) -> Result<Vec<CountryCode>, ApiError> {
        let url = construct_api_url(&self.base_url, "countries");
        self.send_json(self.client.get(url).query(&[("lang", language)]))
            .await
    }
}
