//! Normalizer (C2): folds one `WHATSAPP_MESSAGES_UPSERT` broker event,
//! expressed as a free-form `serde_json::Value`, into an ordered list of
//! [`NormalizedMessage`] plus an `ignored` list carrying a reason per
//! dropped entry.
//!
//! Normalization is a pure function of its inputs: when a message carries
//! no id anywhere (§4.2, "Build messageId"), the fallback id is a v5 UUID
//! derived from the unwrapped content bytes rather than a random v4, so
//! re-processing the same event is reproducible and safe to retry.

use leadengine_wa_core::MessageType;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Per-event overrides the event dispatcher (C5) may supply ahead of the
/// payload/event/metadata cascade described in §4.2 step 2-3.
#[derive(Debug, Clone, Default)]
pub struct NormalizerOverrides {
    pub instance_id: Option<String>,
    pub tenant_id: Option<String>,
    pub broker_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub mime_type: Option<String>,
    pub file_length: Option<i64>,
    pub file_name: Option<String>,
    pub media_key: Option<String>,
    pub direct_path: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotedInfo {
    pub quoted_message_id: Option<String>,
    pub quoted_participant: Option<String>,
    pub quoted_text: Option<String>,
}

/// One folded message, ready for the idempotency key builder (C3) and the
/// inbound pipeline (C6).
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub tenant_id: Option<String>,
    pub instance_id: String,
    pub broker_id: Option<String>,
    pub session_id: Option<String>,
    pub owner: Option<String>,
    pub source: Option<String>,
    pub chat_id: String,
    pub participant: Option<String>,
    pub is_group: bool,
    pub message_type: MessageType,
    pub text: Option<String>,
    pub media: Option<MediaInfo>,
    pub quoted: Option<QuotedInfo>,
    pub timestamp: Option<OffsetDateTime>,
    pub message_index: usize,
    /// Metadata envelope assembled per §4.2 step 5 (broker, source,
    /// direction, raw_key, contact, message_index, tenant_id, session_id,
    /// quoted, interactive). Stays an opaque JSON value: it is semi
    /// structured and evolves with the broker.
    pub metadata: Value,
    /// The unwrapped leaf content record (e.g. the `pollCreationMessage`
    /// object), kept so the pipeline's poll-creation side effect (§4.6 step
    /// 6) can read fields the canonical fields above don't carry.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredMessage {
    pub index: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub messages: Vec<NormalizedMessage>,
    pub ignored: Vec<IgnoredMessage>,
}

/// Runs the C2 algorithm end to end. Returns an empty outcome (no messages,
/// no ignored entries) when the event's type does not indicate an upsert
/// (§4.2 step 1) or when no `instanceId` can be resolved anywhere in the
/// cascade (§4.2 step 2).
pub fn normalize_upsert(event: &Value, overrides: &NormalizerOverrides) -> NormalizeOutcome {
    let event_type = lookup_str(event, "type").or_else(|| lookup_str(event, "event"));
    if let Some(kind) = &event_type {
        if kind != "WHATSAPP_MESSAGES_UPSERT" {
            return NormalizeOutcome::default();
        }
    }

    let instance_id = cascade(event, &overrides.instance_id, "instanceId");
    let Some(instance_id) = instance_id else {
        return NormalizeOutcome::default();
    };
    let tenant_id = cascade(event, &overrides.tenant_id, "tenantId");
    let broker_id = cascade(event, &overrides.broker_id, "brokerId");
    let session_id = cascade(event, &overrides.session_id, "sessionId");
    let owner = cascade(event, &None, "owner");
    let source = cascade(event, &None, "source");
    let fallback_timestamp = cascade(event, &None, "timestamp")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());

    let entries = extract_messages(event);

    let mut outcome = NormalizeOutcome::default();
    for (index, entry) in entries.iter().enumerate() {
        match normalize_entry(
            entry,
            index,
            &instance_id,
            tenant_id.as_deref(),
            broker_id.as_deref(),
            session_id.as_deref(),
            owner.as_deref(),
            source.as_deref(),
            fallback_timestamp,
        ) {
            Ok(message) => outcome.messages.push(message),
            Err(reason) => outcome.ignored.push(IgnoredMessage { index, reason }),
        }
    }
    outcome
}

fn extract_messages(event: &Value) -> Vec<Value> {
    if let Some(arr) = event.get("messages").and_then(Value::as_array) {
        return arr.clone();
    }
    if let Some(arr) = event
        .get("raw")
        .and_then(|r| r.get("messages"))
        .and_then(Value::as_array)
    {
        return arr.clone();
    }
    if let Some(arr) = event
        .get("payload")
        .and_then(|p| p.get("messages"))
        .and_then(Value::as_array)
    {
        return arr.clone();
    }
    Vec::new()
}

/// Looks up a field across the resolution cascade: overrides, payload,
/// event, metadata, broker metadata.
fn cascade(event: &Value, override_val: &Option<String>, key: &str) -> Option<String> {
    if let Some(value) = override_val {
        if !value.trim().is_empty() {
            return Some(value.clone());
        }
    }
    for candidate in [
        lookup_str(event, key),
        event.get("payload").and_then(|v| lookup_str(v, key)),
        event.get("metadata").and_then(|v| lookup_str(v, key)),
        event
            .get("metadata")
            .and_then(|m| m.get("broker"))
            .and_then(|v| lookup_str(v, key)),
        event.get("broker").and_then(|v| lookup_str(v, key)),
        event.get("raw").and_then(|v| lookup_str(v, key)),
    ] {
        if let Some(value) = candidate {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn lookup_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[allow(clippy::too_many_arguments)]
fn normalize_entry(
    entry: &Value,
    index: usize,
    instance_id: &str,
    tenant_id: Option<&str>,
    broker_id: Option<&str>,
    session_id: Option<&str>,
    owner: Option<&str>,
    source: Option<&str>,
    fallback_timestamp: Option<OffsetDateTime>,
) -> Result<NormalizedMessage, &'static str> {
    let key = entry.get("key").cloned().unwrap_or(Value::Null);
    if key.get("fromMe").and_then(Value::as_bool) == Some(true) {
        return Err("from_me");
    }
    if entry.get("messageStubType").is_some() {
        return Err("message_stub");
    }

    let mut content = entry.get("message").cloned().unwrap_or(Value::Null);
    loop {
        if let Some(inner) = content.get("ephemeralMessage").and_then(|v| v.get("message")) {
            content = inner.clone();
            continue;
        }
        if let Some(inner) = content.get("viewOnceMessage").and_then(|v| v.get("message")) {
            content = inner.clone();
            continue;
        }
        if let Some(inner) = content.get("viewOnceMessageV2").and_then(|v| v.get("message")) {
            content = inner.clone();
            continue;
        }
        break;
    }

    if content.is_null() || content.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return Err("empty_message");
    }
    if content.get("protocolMessage").is_some() {
        return Err("protocol_message");
    }
    if content.get("historySyncNotification").is_some() {
        return Err("history_sync");
    }

    let (message_type, leaf_key) = classify(&content);
    let leaf = leaf_key.and_then(|k| content.get(k)).cloned().unwrap_or(Value::Null);

    let text = derive_text(&content, &leaf, message_type);
    let media = if message_type.is_media() {
        Some(derive_media(&leaf))
    } else {
        None
    };
    let quoted = extract_quoted(&leaf);

    let remote_jid = key.get("remoteJid").and_then(Value::as_str).unwrap_or("");
    let participant_raw = key.get("participant").and_then(Value::as_str);
    let chat_id = normalize_jid(remote_jid);
    let participant = participant_raw.map(normalize_jid);
    let is_group = remote_jid.ends_with("@g.us");

    let message_id = entry
        .get("message")
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .or_else(|| key.get("id").and_then(Value::as_str).map(|s| s.to_string()))
        .unwrap_or_else(|| {
            let bytes = serde_json::to_vec(&content).unwrap_or_default();
            format!("wamid-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, &bytes))
        });

    let timestamp = entry
        .get("messageTimestamp")
        .and_then(Value::as_i64)
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .or(fallback_timestamp);

    let push_name = entry.get("pushName").and_then(Value::as_str);

    let metadata = serde_json::json!({
        "broker": "baileys",
        "source": source,
        "direction": "inbound",
        "rawKey": key,
        "contact": { "pushName": push_name },
        "messageIndex": index,
        "tenantId": tenant_id,
        "sessionId": session_id,
        "quoted": quoted.as_ref().map(|q| serde_json::json!({
            "quotedMessageId": q.quoted_message_id,
            "quotedParticipant": q.quoted_participant,
            "quotedText": q.quoted_text,
        })),
        "interactive": matches!(message_type, MessageType::Template),
    });

    Ok(NormalizedMessage {
        message_id,
        tenant_id: tenant_id.map(|s| s.to_string()),
        instance_id: instance_id.to_string(),
        broker_id: broker_id.map(|s| s.to_string()),
        session_id: session_id.map(|s| s.to_string()),
        owner: owner.map(|s| s.to_string()),
        source: source.map(|s| s.to_string()),
        chat_id,
        participant,
        is_group,
        message_type,
        text,
        media,
        quoted,
        timestamp,
        message_index: index,
        metadata,
        raw: content,
    })
}

/// Priority order from §4.2 step 5: poll creation > poll update > list
/// response > buttons response > image/sticker > video > audio > document >
/// location > contact > otherwise text.
fn classify(content: &Value) -> (MessageType, Option<&'static str>) {
    const CHECKS: &[(&str, MessageType)] = &[
        ("pollCreationMessage", MessageType::Poll),
        ("pollUpdateMessage", MessageType::PollChoice),
        ("listResponseMessage", MessageType::Template),
        ("buttonsResponseMessage", MessageType::Template),
        ("imageMessage", MessageType::Image),
        ("stickerMessage", MessageType::Image),
        ("videoMessage", MessageType::Video),
        ("audioMessage", MessageType::Audio),
        ("documentMessage", MessageType::Document),
        ("locationMessage", MessageType::Location),
        ("contactMessage", MessageType::Contact),
        // Not a distinct canonical type (folds to `Text`, see `derive_text`'s
        // `conversation` priority) but still needs a leaf so `extract_quoted`
        // can reach `extendedTextMessage.contextInfo.quotedMessage`.
        ("extendedTextMessage", MessageType::Text),
    ];
    for (key, kind) in CHECKS {
        if content.get(key).is_some() {
            return (*kind, Some(key));
        }
    }
    (MessageType::Text, None)
}

fn derive_text(content: &Value, leaf: &Value, message_type: MessageType) -> Option<String> {
    if let Some(text) = content.get("conversation").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(text) = content
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(text) = leaf
        .get("selectedDisplayText")
        .and_then(Value::as_str)
        .or_else(|| leaf.get("selectedButtonId").and_then(Value::as_str))
    {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = leaf.get("caption").and_then(Value::as_str) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if let Some(title) = leaf
        .get("title")
        .and_then(Value::as_str)
        .or_else(|| leaf.get("description").and_then(Value::as_str))
    {
        if !title.is_empty() {
            return Some(title.to_string());
        }
    }
    if let Some(name) = leaf.get("name").and_then(Value::as_str) {
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    if message_type.is_media() {
        Some("[Mensagem recebida via WhatsApp]".to_string())
    } else {
        None
    }
}

fn derive_media(leaf: &Value) -> MediaInfo {
    MediaInfo {
        mime_type: leaf.get("mimetype").and_then(Value::as_str).map(String::from),
        file_length: leaf
            .get("fileLength")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| leaf.get("fileLength").and_then(Value::as_i64)),
        file_name: leaf.get("fileName").and_then(Value::as_str).map(String::from),
        media_key: leaf.get("mediaKey").and_then(Value::as_str).map(String::from),
        direct_path: leaf.get("directPath").and_then(Value::as_str).map(String::from),
        caption: leaf.get("caption").and_then(Value::as_str).map(String::from),
    }
}

fn extract_quoted(leaf: &Value) -> Option<QuotedInfo> {
    let context_info = leaf.get("contextInfo")?;
    let quoted_message = context_info.get("quotedMessage")?;
    let quoted_text = quoted_message
        .get("conversation")
        .and_then(Value::as_str)
        .or_else(|| {
            quoted_message
                .get("extendedTextMessage")
                .and_then(|m| m.get("text"))
                .and_then(Value::as_str)
        })
        .map(String::from);
    Some(QuotedInfo {
        quoted_message_id: context_info.get("stanzaId").and_then(Value::as_str).map(String::from),
        quoted_participant: context_info.get("participant").and_then(Value::as_str).map(String::from),
        quoted_text,
    })
}

/// Digits-only when the pre-`@` portion has at least 8 digits; otherwise the
/// raw pre-`@` portion is kept (covers LID/group ids that aren't phone
/// numbers).
fn normalize_jid(jid: &str) -> String {
    let before_at = jid.split('@').next().unwrap_or(jid);
    let digits: String = before_at.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 8 {
        digits
    } else {
        before_at.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(messages: Value) -> Value {
        json!({
            "type": "WHATSAPP_MESSAGES_UPSERT",
            "instanceId": "inst-1",
            "tenantId": "tenant-A",
            "messages": messages,
        })
    }

    #[test]
    fn rejects_non_upsert_event_types() {
        let event = json!({ "type": "OTHER_EVENT", "instanceId": "inst-1", "messages": [] });
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert!(outcome.messages.is_empty());
        assert!(outcome.ignored.is_empty());
    }

    #[test]
    fn returns_empty_without_instance_id() {
        let event = json!({ "type": "WHATSAPP_MESSAGES_UPSERT", "messages": [] });
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn from_me_entries_are_ignored_and_never_normalized() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": true, "id": "AAA" },
                "message": { "conversation": "hi" },
                "messageTimestamp": 1700000000,
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.ignored, vec![IgnoredMessage { index: 0, reason: "from_me" }]);
    }

    #[test]
    fn text_message_is_normalized() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false, "id": "WAID1" },
                "message": { "conversation": "Ol\u{00e1}" },
                "messageTimestamp": 1700000000,
                "pushName": "Maria",
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert_eq!(outcome.messages.len(), 1);
        let msg = &outcome.messages[0];
        assert_eq!(msg.message_type, MessageType::Text);
        assert_eq!(msg.text.as_deref(), Some("Ol\u{00e1}"));
        assert_eq!(msg.chat_id, "5511999999999");
        assert!(!msg.is_group);
        assert_eq!(msg.message_id, "WAID1");
    }

    #[test]
    fn unwraps_ephemeral_and_view_once_chains() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false, "id": "WAID2" },
                "message": {
                    "ephemeralMessage": {
                        "message": {
                            "viewOnceMessage": {
                                "message": { "conversation": "secret" }
                            }
                        }
                    }
                },
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert_eq!(outcome.messages[0].text.as_deref(), Some("secret"));
    }

    #[test]
    fn empty_protocol_and_history_sync_are_ignored() {
        let event = sample_event(json!([
            { "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false, "id": "p1" }, "message": { "protocolMessage": {} } },
            { "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false, "id": "p2" }, "message": { "historySyncNotification": {} } },
            { "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false, "id": "p3" }, "message": {} },
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert!(outcome.messages.is_empty());
        let reasons: Vec<_> = outcome.ignored.iter().map(|i| i.reason).collect();
        assert_eq!(reasons, vec!["protocol_message", "history_sync", "empty_message"]);
    }

    #[test]
    fn message_stub_is_ignored() {
        let event = sample_event(json!([
            { "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false }, "messageStubType": 2, "message": {} }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert_eq!(outcome.ignored[0].reason, "message_stub");
    }

    #[test]
    fn image_message_gets_media_fallback_text_and_fields() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "5511988887777@s.whatsapp.net", "fromMe": false, "id": "img1" },
                "message": {
                    "imageMessage": {
                        "mimetype": "image/jpeg",
                        "fileLength": "2048",
                        "mediaKey": "key==",
                        "directPath": "/v/path",
                    }
                },
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        let msg = &outcome.messages[0];
        assert_eq!(msg.message_type, MessageType::Image);
        assert_eq!(msg.text.as_deref(), Some("[Mensagem recebida via WhatsApp]"));
        let media = msg.media.as_ref().unwrap();
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(media.file_length, Some(2048));
    }

    #[test]
    fn group_jid_is_detected_and_participant_normalized() {
        let event = sample_event(json!([
            {
                "key": {
                    "remoteJid": "123456789-987654@g.us",
                    "participant": "5511977776666@s.whatsapp.net",
                    "fromMe": false,
                    "id": "g1",
                },
                "message": { "conversation": "group hi" },
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        let msg = &outcome.messages[0];
        assert!(msg.is_group);
        assert_eq!(msg.participant.as_deref(), Some("5511977776666"));
    }

    #[test]
    fn missing_message_id_falls_back_to_uuid_prefix() {
        let event = sample_event(json!([
            { "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false }, "message": { "conversation": "x" } }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        assert!(outcome.messages[0].message_id.starts_with("wamid-"));
    }

    #[test]
    fn poll_creation_is_classified_and_carries_raw_for_pipeline() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false, "id": "poll1" },
                "message": {
                    "pollCreationMessage": {
                        "name": "Favorite color?",
                        "options": [{"optionName": "Red"}, {"optionName": "Blue"}],
                    }
                },
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        let msg = &outcome.messages[0];
        assert_eq!(msg.message_type, MessageType::Poll);
        assert_eq!(msg.text.as_deref(), Some("Favorite color?"));
        assert!(msg.raw.get("pollCreationMessage").is_some());
    }

    #[test]
    fn quoted_context_is_extracted() {
        let event = sample_event(json!([
            {
                "key": { "remoteJid": "a@s.whatsapp.net", "fromMe": false, "id": "q1" },
                "message": {
                    "extendedTextMessage": {
                        "text": "reply",
                        "contextInfo": {
                            "stanzaId": "orig-1",
                            "participant": "5511900000000@s.whatsapp.net",
                            "quotedMessage": { "conversation": "original text" }
                        }
                    }
                },
            }
        ]));
        let outcome = normalize_upsert(&event, &NormalizerOverrides::default());
        let quoted = outcome.messages[0].quoted.as_ref().unwrap();
        assert_eq!(quoted.quoted_message_id.as_deref(), Some("orig-1"));
        assert_eq!(quoted.quoted_text.as_deref(), Some("original text"));
    }

    #[test]
    fn instance_override_wins_over_payload_value() {
        let mut event = sample_event(json!([]));
        event["instanceId"] = json!("payload-instance");
        let overrides = NormalizerOverrides {
            instance_id: Some("override-instance".to_string()),
            ..Default::default()
        };
        let outcome = normalize_upsert(&event, &overrides);
        assert!(outcome.messages.is_empty() && outcome.ignored.is_empty());
    }
}
