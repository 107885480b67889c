use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use std::collections::HashMap;

use super::{Channel, MessageHandle};
use crate::error::ChannelError;
use crate::types::{Attachment, InboundMessage, MediaKind, OutboundMedia, WhatsAppInstance};

/// WhatsApp Cloud API sender for one phone number.
pub struct WhatsAppCloudChannel {
    http: reqwest::Client,
    api_base: String,
    phone_number_id: String,
    access_token: String,
}

impl WhatsAppCloudChannel {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        phone_number_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let phone_number_id = phone_number_id.into();
        let access_token = access_token.into();
        if phone_number_id.trim().is_empty() || access_token.trim().is_empty() {
            return Err(ChannelError::Config(
                "missing whatsapp accessToken or phoneNumberId".to_string(),
            ));
        }
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            phone_number_id,
            access_token,
        })
    }

    pub fn from_instance(
        http: reqwest::Client,
        api_base: &str,
        instance: &WhatsAppInstance,
    ) -> Result<Self, ChannelError> {
        Self::new(
            http,
            api_base,
            &instance.phone_number_id,
            &instance.access_token,
        )
    }

    async fn post(&self, payload: Value) -> Result<MessageHandle, ChannelError> {
        let response = self
            .http
            .post(format!("{}/{}/messages", self.api_base, self.phone_number_id))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({}));
        let id = body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| messages.first())
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(MessageHandle { id })
    }
}

fn recipient(chat_id: &str) -> String {
    normalize_whatsapp_phone(chat_id).unwrap_or_else(|| chat_id.to_string())
}

/// Cloud API payload for a media message.
fn media_payload(to: &str, media: &OutboundMedia, caption: Option<&str>) -> Value {
    let caption = caption.unwrap_or("");
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": media.kind.as_str(),
    });
    payload[media.kind.as_str()] = match media.kind {
        MediaKind::Image | MediaKind::Video => json!({ "link": media.url, "caption": caption }),
        MediaKind::Audio => json!({ "link": media.url }),
        MediaKind::Document => json!({
            "link": media.url,
            "filename": media.filename.as_deref().unwrap_or("attachment"),
            "caption": caption,
        }),
    };
    payload
}

#[async_trait]
impl Channel for WhatsAppCloudChannel {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        self.post(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient(chat_id),
            "type": "text",
            "text": { "preview_url": false, "body": text },
        }))
        .await
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<MessageHandle, ChannelError> {
        if media.url.trim().is_empty() {
            return Err(ChannelError::Config(
                "missing media url for whatsapp media send".to_string(),
            ));
        }
        self.post(media_payload(&recipient(chat_id), media, caption))
            .await
    }
}

pub fn normalize_whatsapp_phone(raw: &str) -> Option<String> {
    let digits = raw
        .split('@')
        .next()
        .unwrap_or(raw)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Why a webhook delivery failed signature checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature is not sha256 hex")]
    Malformed,
    #[error("signature does not match body")]
    Mismatch,
}

/// Checks an `X-Hub-Signature-256` value (`sha256=<hex>`) against the app
/// secret. Instances without a secret accept every delivery.
pub fn verify_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<(), SignatureError> {
    if app_secret.is_empty() {
        return Ok(());
    }
    let header = signature_header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SignatureError::Missing)?;
    let expected = header
        .strip_prefix("sha256=")
        .and_then(|hex_digest| hex::decode(hex_digest.trim()).ok())
        .filter(|digest| !digest.is_empty())
        .ok_or(SignatureError::Malformed)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes())
        .map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for contact in value
        .get("contacts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_whatsapp_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if !name.is_empty() {
            map.insert(digits, name);
        }
    }
    map
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
}

/// Text and attachment carried by one Cloud API message. `None` for unsupported shapes.
fn inbound_content(message: &Value) -> Option<(String, Option<Attachment>)> {
    let msg_type = str_at(message, &["type"]).to_ascii_lowercase();
    match msg_type.as_str() {
        "text" => Some((str_at(message, &["text", "body"]).to_string(), None)),
        "button" => Some((str_at(message, &["button", "text"]).to_string(), None)),
        "interactive" => {
            let button = str_at(message, &["interactive", "button_reply", "title"]);
            let text = if button.is_empty() {
                str_at(message, &["interactive", "list_reply", "title"])
            } else {
                button
            };
            Some((text.to_string(), None))
        }
        "image" | "audio" | "video" | "document" | "sticker" => {
            let body = message.get(&msg_type)?;
            let media_id = str_at(body, &["id"]);
            let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
            let attachment = Attachment {
                media_type: msg_type.clone(),
                mime_type: non_empty(str_at(body, &["mime_type"])),
                url: non_empty(media_id).map(|id| format!("whatsapp-media:{id}")),
                filename: non_empty(str_at(body, &["filename"])),
            };
            Some((str_at(body, &["caption"]).to_string(), Some(attachment)))
        }
        _ => None,
    }
}

/// Flattens a Cloud API webhook payload into inbound messages.
///
/// Changes addressed to a different phone number id are skipped.
pub fn parse_webhook_payload(payload: &Value, expected_phone_number_id: &str) -> Vec<InboundMessage> {
    let mut inbound = Vec::new();
    let entries = payload.get("entry").and_then(Value::as_array).into_iter().flatten();
    for entry in entries {
        let changes = entry.get("changes").and_then(Value::as_array).into_iter().flatten();
        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let metadata_phone_id = str_at(value, &["metadata", "phone_number_id"]);
            if !expected_phone_number_id.is_empty()
                && !metadata_phone_id.is_empty()
                && expected_phone_number_id != metadata_phone_id
            {
                continue;
            }
            let names = contact_profile_names(value);

            for message in value.get("messages").and_then(Value::as_array).into_iter().flatten() {
                let Some(from) = normalize_whatsapp_phone(str_at(message, &["from"])) else {
                    continue;
                };
                let Some((body, attachment)) = inbound_content(message) else {
                    continue;
                };
                let timestamp = str_at(message, &["timestamp"])
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    .unwrap_or_else(Utc::now);
                inbound.push(InboundMessage {
                    id: str_at(message, &["id"]).to_string(),
                    contact_name: names.get(&from).cloned(),
                    from,
                    body,
                    from_me: false,
                    is_group: false,
                    attachment,
                    timestamp,
                });
            }
        }
    }
    inbound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_verification() {
        let body = br#"{"entry":[]}"#;
        let header = sign("s3cret", body);
        assert_eq!(verify_signature("s3cret", Some(&header), body), Ok(()));
        assert_eq!(
            verify_signature("other", Some(&header), body),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(verify_signature("s3cret", None, body), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature("s3cret", Some("sha256=zz"), body),
            Err(SignatureError::Malformed)
        );
        let bare = header.trim_start_matches("sha256=");
        assert_eq!(
            verify_signature("s3cret", Some(bare), body),
            Err(SignatureError::Malformed)
        );
        assert_eq!(verify_signature("", None, body), Ok(()));
    }

    #[test]
    fn parses_text_interactive_and_media_messages() {
        let payload = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "PN1" },
                        "contacts": [{ "wa_id": "5511999", "profile": { "name": "Ana" } }],
                        "messages": [
                            { "id": "w1", "from": "5511999", "timestamp": "1700000000", "type": "text", "text": { "body": " Hi " } },
                            { "id": "w2", "from": "5511999", "type": "interactive",
                              "interactive": { "list_reply": { "title": "Sales" } } },
                            { "id": "w3", "from": "5511888", "type": "image",
                              "image": { "id": "MID", "mime_type": "image/jpeg", "caption": "receipt" } },
                            { "id": "w4", "from": "5511888", "type": "reaction" }
                        ]
                    }
                }]
            }]
        });
        let messages = parse_webhook_payload(&payload, "PN1");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].body, "Hi");
        assert_eq!(messages[0].contact_name.as_deref(), Some("Ana"));
        assert_eq!(messages[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(messages[1].body, "Sales");
        let attachment = messages[2].attachment.as_ref().unwrap();
        assert_eq!(attachment.media_type, "image");
        assert_eq!(attachment.url.as_deref(), Some("whatsapp-media:MID"));
        assert_eq!(messages[2].body, "receipt");
        assert_eq!(messages[2].contact_name(), "5511888");
    }

    #[test]
    fn skips_changes_for_other_numbers() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "OTHER" },
                "messages": [{ "id": "w1", "from": "1", "type": "text", "text": { "body": "x" } }]
            } }] }]
        });
        assert!(parse_webhook_payload(&payload, "PN1").is_empty());
    }

    #[test]
    fn builds_document_payload() {
        let media = OutboundMedia {
            kind: MediaKind::Document,
            url: "https://cdn.example.com/a.pdf".into(),
            filename: Some("a.pdf".into()),
            mime_type: None,
        };
        let payload = media_payload("5511", &media, Some("Your invoice"));
        assert_eq!(payload["type"], "document");
        assert_eq!(payload["document"]["filename"], "a.pdf");
        assert_eq!(payload["document"]["caption"], "Your invoice");
    }

    #[test]
    fn rejects_missing_credentials() {
        assert!(matches!(
            WhatsAppCloudChannel::new(reqwest::Client::new(), "https://x", "", "token"),
            Err(ChannelError::Config(_))
        ));
    }
}
