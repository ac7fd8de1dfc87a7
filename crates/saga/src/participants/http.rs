//! Participant reached over HTTP.

use async_trait::async_trait;
use reqwest::Client;

use super::{Operation, ParticipantCall, ParticipantError};

/// Posts the [`ParticipantCall`] as JSON to a fixed URL.
///
/// A 2xx response is a success and its JSON body, if any, becomes the step
/// output. Any other status is reported as [`ParticipantError::Status`] with
/// the response body as message.
#[derive(Debug, Clone)]
pub struct HttpOperation {
    name: String,
    url: String,
    client: Client,
}

impl HttpOperation {
    pub fn new(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_error(err: reqwest::Error) -> ParticipantError {
        if err.is_timeout() {
            ParticipantError::Timeout(err.to_string())
        } else {
            ParticipantError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl Operation for HttpOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        call: &ParticipantCall,
    ) -> Result<Option<serde_json::Value>, ParticipantError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &call.idempotency_key)
            .json(call)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ParticipantError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await.map_err(Self::transport_error)?;
        if body.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&body).map(Some).map_err(|e| {
            ParticipantError::Rejected(format!("participant returned invalid JSON: {e}"))
        })
    }
}
