//! Direct uploads: turn an uploaded file into a [`SourceItem`].
//!
//! An RFC 822 message (`.eml` or `message/rfc822`) is parsed with
//! `mail-parser` and its attachments become candidates. Anything else is
//! wrapped as a single-attachment item. Item ids are derived from content, so
//! uploading the same bytes twice yields the same task ids.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use tracing::debug;
use uuid::Uuid;

use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem, extension_of};

const UPLOAD_NAMESPACE: Uuid = Uuid::from_u128(0x9b3e_61d4_27a8_4f05_b1c2_6d7e_0a95_3f48);

/// Uploader identity used when the caller gives none.
pub const ANONYMOUS_UPLOADER: &str = "upload";

/// True when the upload should be parsed as a mail message.
pub fn is_message(filename: &str, mime_type: &str) -> bool {
    mime_type.eq_ignore_ascii_case("message/rfc822")
        || extension_of(filename).as_deref() == Some(".eml")
}

/// Build a [`SourceItem`] from an uploaded file.
///
/// Messages that `mail-parser` cannot make sense of fall back to the raw-file
/// path, so an upload never fails outright.
pub fn item_from_upload(filename: &str, mime_type: &str, bytes: &[u8], uploader: &str) -> SourceItem {
    if is_message(filename, mime_type)
        && let Some(item) = parse_message(bytes)
    {
        return item;
    }
    raw_file_item(filename, mime_type, bytes, uploader)
}

fn raw_file_item(filename: &str, mime_type: &str, bytes: &[u8], uploader: &str) -> SourceItem {
    let mut key = Vec::with_capacity(filename.len() + 1 + bytes.len());
    key.extend_from_slice(filename.as_bytes());
    key.push(0);
    key.extend_from_slice(bytes);
    let id = Uuid::new_v5(&UPLOAD_NAMESPACE, &key).to_string();

    let uploader = if uploader.trim().is_empty() {
        ANONYMOUS_UPLOADER
    } else {
        uploader
    };
    SourceItem::new(id, filename, SenderIdentity::new(uploader, uploader))
        .with_attachment(AttachmentCandidate::new("file", filename, mime_type, bytes.to_vec()))
}

/// Parse an RFC 822 message. `None` when the bytes have no recognisable headers.
pub fn parse_message(bytes: &[u8]) -> Option<SourceItem> {
    let msg = MessageParser::default().parse(bytes)?;
    if msg.headers().is_empty() {
        return None;
    }

    let sender = msg
        .from()
        .and_then(|addr| addr.first())
        .map(|a| {
            SenderIdentity::new(a.name().unwrap_or_default(), a.address().unwrap_or_default())
        })
        .unwrap_or_default();

    let received_at = msg
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body = msg.body_text(0).map(|b| b.into_owned()).unwrap_or_default();

    let mut item = SourceItem::new(
        Uuid::new_v5(&UPLOAD_NAMESPACE, bytes).to_string(),
        msg.subject().unwrap_or_default(),
        sender,
    )
    .with_snippet(&body)
    .with_received_at(received_at);

    for (idx, part) in msg.attachments().enumerate() {
        let filename = part
            .attachment_name()
            .map(String::from)
            .unwrap_or_else(|| format!("attachment_{idx}"));
        let mime_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{sub}", ct.ctype()),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_default();
        item.attachments.push(AttachmentCandidate::new(
            format!("part-{idx}"),
            filename,
            mime_type,
            part.contents().to_vec(),
        ));
    }

    debug!(item_id = %item.id, attachments = item.attachments.len(), "Parsed uploaded message");
    Some(item)
}
