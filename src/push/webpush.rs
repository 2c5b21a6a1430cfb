//! Web Push (RFC 8030) transport.
//!
//! Payload encryption (aes128gcm) and the VAPID signature come from the
//! `web-push` crate; the POST itself goes through `reqwest` so timeouts and
//! response classification stay under our control.

use std::time::Duration;

use async_trait::async_trait;
use web_push::{
    ContentEncoding, PartialVapidSignatureBuilder, SubscriptionInfo, URL_SAFE_NO_PAD,
    VapidSignatureBuilder, WebPushMessageBuilder,
};

use crate::config::PushConfig;
use crate::error::{NotifyError, Result};
use crate::push::payload::NotificationPayload;
use crate::push::{DeliveryError, PushTransport, classify_response};
use crate::scheduler::tasks::PushSubscription;

/// An encrypted, signed request ready to POST to a push service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPush {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Sends notifications through browser push services.
#[derive(Clone)]
pub struct WebPushTransport {
    vapid: PartialVapidSignatureBuilder,
    subject: String,
    ttl_secs: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for WebPushTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebPushTransport")
            .field("subject", &self.subject)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl WebPushTransport {
    /// Build a transport from config.
    ///
    /// Fails with [`NotifyError::ConfigurationMissing`] when either VAPID key
    /// is absent, and with [`NotifyError::Config`] when the private key does
    /// not decode.
    pub fn from_config(config: &PushConfig) -> Result<Self> {
        let (Some(_public), Some(private)) = (
            non_empty(config.vapid_public_key.as_deref()),
            non_empty(config.vapid_private_key.as_deref()),
        ) else {
            return Err(NotifyError::ConfigurationMissing(
                "push.vapid_public_key and push.vapid_private_key must both be set".to_owned(),
            ));
        };

        // Keys are distributed as unpadded base64url, as browsers expect.
        let vapid = VapidSignatureBuilder::from_base64_no_sub(private, URL_SAFE_NO_PAD)
            .map_err(|e| NotifyError::Config(format!("invalid VAPID private key: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| NotifyError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            vapid,
            subject: config.subject.clone(),
            ttl_secs: config.ttl_secs,
            client,
        })
    }

    /// Encrypt `payload` for `subscription` and sign the request.
    ///
    /// Malformed subscription keys or endpoints are reported as permanent:
    /// retrying can never fix them.
    pub fn prepare(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> std::result::Result<PreparedPush, DeliveryError> {
        let body = payload
            .to_json_bytes()
            .map_err(|e| DeliveryError::permanent(format!("cannot encode payload: {e}")))?;

        let info = SubscriptionInfo::new(
            subscription.endpoint.as_str(),
            subscription.keys.p256dh.as_str(),
            subscription.keys.auth.as_str(),
        );

        let mut signer = self.vapid.clone().add_sub_info(&info);
        signer.add_claim("sub", self.subject.as_str());
        let signature = signer
            .build()
            .map_err(|e| DeliveryError::permanent(format!("cannot sign request: {e}")))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &body);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl_secs);
        let message = builder
            .build()
            .map_err(|e| DeliveryError::permanent(format!("cannot encrypt payload: {e}")))?;

        let mut headers = vec![("TTL".to_owned(), message.ttl.to_string())];
        let mut content = Vec::new();
        if let Some(encrypted) = message.payload {
            headers.push((
                "Content-Encoding".to_owned(),
                encrypted.content_encoding.to_str().to_owned(),
            ));
            headers.push((
                "Content-Type".to_owned(),
                "application/octet-stream".to_owned(),
            ));
            headers.extend(
                encrypted
                    .crypto_headers
                    .into_iter()
                    .map(|(name, value)| (name.to_owned(), value)),
            );
            content = encrypted.content;
        }

        Ok(PreparedPush {
            endpoint: message.endpoint.to_string(),
            headers,
            body: content,
        })
    }

    /// POST a prepared request and classify the push service's answer.
    pub async fn deliver(&self, prepared: PreparedPush) -> std::result::Result<(), DeliveryError> {
        let mut request = self.client.post(&prepared.endpoint);
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(prepared.body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::transient(format!("push service timed out: {e}"))
            } else if e.is_builder() {
                DeliveryError::permanent(format!("invalid push endpoint: {e}"))
            } else {
                DeliveryError::transient(format!("push request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    fn id(&self) -> &'static str {
        "webpush"
    }

    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> std::result::Result<(), DeliveryError> {
        let prepared = self.prepare(subscription, payload)?;
        self.deliver(prepared).await
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
