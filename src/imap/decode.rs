//! Pure mapping from FETCH attributes to `FetchedEmail`.
//!
//! Nothing here touches the network, so canned server responses parsed with `imap-proto`
//! exercise exactly the code the live session runs.
use async_imap::imap_proto::types::{
    Address, AttributeValue, BodyContentCommon, BodyContentSinglePart, BodyStructure,
    ContentEncoding, Envelope,
};
use async_imap::types::{Fetch, Flag};
use chrono::DateTime;
use std::borrow::Cow;

use crate::types::{AttachmentMeta, EmailFlags, FetchedEmail};

/// The attributes of one FETCH response that the decoder consumes.
#[derive(Debug, Default)]
pub struct FetchParts<'a> {
    pub uid: Option<u32>,
    /// Canonical flag atoms, e.g. `\Seen`.
    pub flags: Vec<String>,
    pub size: Option<u32>,
    pub internal_date: Option<i64>,
    pub envelope: Option<&'a Envelope<'a>>,
    pub body_structure: Option<&'a BodyStructure<'a>>,
}

impl<'a> FetchParts<'a> {
    pub fn from_fetch(fetch: &'a Fetch) -> Self {
        Self {
            uid: fetch.uid,
            flags: fetch.flags().map(|f| flag_atom(&f)).collect(),
            size: fetch.size,
            internal_date: fetch.internal_date().map(|dt| dt.timestamp()),
            envelope: fetch.envelope(),
            body_structure: fetch.bodystructure(),
        }
    }

    pub fn from_attributes(attrs: &'a [AttributeValue<'a>]) -> Self {
        let mut parts = FetchParts::default();
        for attr in attrs {
            match attr {
                AttributeValue::Uid(uid) => parts.uid = Some(*uid),
                AttributeValue::Flags(flags) => {
                    parts.flags = flags.iter().map(|f| f.to_string()).collect();
                }
                AttributeValue::Rfc822Size(size) => parts.size = Some(*size),
                AttributeValue::InternalDate(raw) => {
                    parts.internal_date = DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
                        .ok()
                        .map(|dt| dt.timestamp());
                }
                AttributeValue::Envelope(envelope) => parts.envelope = Some(envelope.as_ref()),
                AttributeValue::BodyStructure(bs) => parts.body_structure = Some(bs),
                _ => {}
            }
        }
        parts
    }
}

fn flag_atom(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(other) => other.to_string(),
    }
}

pub fn map_flags(flags: &[String]) -> EmailFlags {
    let has = |name: &str| flags.iter().any(|f| f.eq_ignore_ascii_case(name));
    EmailFlags {
        read: has("\\Seen"),
        starred: has("\\Flagged"),
        replied: has("\\Answered"),
    }
}

/// Returns `None` when the response carries no UID.
pub fn decode_fetch(parts: &FetchParts<'_>) -> Option<FetchedEmail> {
    let uid = parts.uid.filter(|uid| *uid > 0)?;

    let mut email = FetchedEmail {
        uid,
        flags: map_flags(&parts.flags),
        size_bytes: parts.size.unwrap_or(0),
        date: parts.internal_date,
        ..Default::default()
    };

    if let Some(env) = parts.envelope {
        email.message_id = env.message_id.as_deref().map(strip_angle_id).unwrap_or_default();
        email.in_reply_to = env.in_reply_to.as_deref().map(strip_angle_id).unwrap_or_default();
        email.subject = env
            .subject
            .as_deref()
            .map(|raw| decode_mime_header(&lossy(raw)))
            .unwrap_or_default();

        if let Some(sender) = env.from.as_ref().and_then(|addrs| addrs.first()) {
            email.from_name = sender
                .name
                .as_deref()
                .map(|raw| decode_mime_header(&lossy(raw)))
                .unwrap_or_default();
            email.from_email = address_email(sender);
        }
        email.to_addrs = format_addresses(env.to.as_deref());
        email.cc_addrs = format_addresses(env.cc.as_deref());

        if let Some(ts) = env
            .date
            .as_deref()
            .and_then(|raw| mailparse::dateparse(&lossy(raw)).ok())
        {
            email.date = Some(ts);
        }
    }

    if let Some(bs) = parts.body_structure {
        let mut walk = AttachmentWalk::default();
        walk.visit(bs, "");
        email.has_attachments = walk.has_attachments;
        email.attachments = walk.attachments;
    }

    Some(email)
}

fn lossy(raw: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(raw)
}

fn strip_angle_id(raw: &[u8]) -> String {
    lossy(raw)
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// RFC 2047 encoded-word decoding via mailparse's header parser.
pub fn decode_mime_header(header: &str) -> String {
    let line = format!("Subject: {}\r\n", header);
    match mailparse::parse_header(line.as_bytes()) {
        Ok((parsed, _)) => parsed.get_value(),
        Err(_) => header.to_string(),
    }
}

fn address_email(addr: &Address<'_>) -> String {
    match (addr.mailbox.as_deref(), addr.host.as_deref()) {
        (Some(mailbox), Some(host)) => format!("{}@{}", lossy(mailbox), lossy(host)),
        (Some(mailbox), None) => lossy(mailbox).into_owned(),
        _ => String::new(),
    }
}

fn format_addresses(addrs: Option<&[Address<'_>]>) -> String {
    let Some(addrs) = addrs else {
        return String::new();
    };
    addrs
        .iter()
        .filter_map(|addr| {
            let email = address_email(addr);
            if email.is_empty() {
                return None;
            }
            let name = addr
                .name
                .as_deref()
                .map(|raw| decode_mime_header(&lossy(raw)))
                .unwrap_or_default();
            Some(if name.is_empty() {
                email
            } else {
                format!("{} <{}>", name, email)
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Default)]
struct AttachmentWalk {
    has_attachments: bool,
    attachments: Vec<AttachmentMeta>,
}

impl AttachmentWalk {
    fn visit(&mut self, bs: &BodyStructure<'_>, part: &str) {
        match bs {
            BodyStructure::Multipart { bodies, .. } => {
                for (i, child) in bodies.iter().enumerate() {
                    let child_part = if part.is_empty() {
                        (i + 1).to_string()
                    } else {
                        format!("{}.{}", part, i + 1)
                    };
                    self.visit(child, &child_part);
                }
            }
            BodyStructure::Basic { common, other, .. }
            | BodyStructure::Text { common, other, .. }
            | BodyStructure::Message { common, other, .. } => {
                let number = if part.is_empty() { "1" } else { part };
                self.single_part(common, other, number);
            }
        }
    }

    fn single_part(&mut self, common: &BodyContentCommon<'_>, other: &BodyContentSinglePart<'_>, part: &str) {
        let content_type = format!(
            "{}/{}",
            common.ty.ty.to_ascii_lowercase(),
            common.ty.subtype.to_ascii_lowercase()
        );
        let filename = common
            .disposition
            .as_ref()
            .and_then(|d| param(&d.params, "filename"))
            .or_else(|| param(&common.ty.params, "name"))
            .map(|f| decode_mime_header(&f))
            .unwrap_or_default();
        let content_id = other
            .id
            .as_deref()
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
            .unwrap_or_default();

        let is_text_body = content_type == "text/plain" || content_type == "text/html";
        if is_text_body && filename.is_empty() {
            return;
        }

        let is_text = content_type.starts_with("text/");
        if !filename.is_empty() || !content_id.is_empty() || !is_text {
            self.has_attachments = true;
        }

        let listed_type = ["image/", "audio/", "video/", "application/"]
            .iter()
            .any(|prefix| content_type.starts_with(prefix));
        if filename.is_empty() && !listed_type {
            return;
        }

        let is_inline = common
            .disposition
            .as_ref()
            .is_some_and(|d| d.ty.eq_ignore_ascii_case("inline"));

        self.attachments.push(AttachmentMeta {
            part_number: part.to_string(),
            filename,
            content_type,
            content_id,
            encoding: encoding_name(&other.transfer_encoding),
            charset: param(&common.ty.params, "charset").unwrap_or_default(),
            size: other.octets as u64,
            is_inline,
        });
    }
}

fn param(params: &Option<Vec<(Cow<'_, str>, Cow<'_, str>)>>, key: &str) -> Option<String> {
    params
        .as_ref()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

fn encoding_name(encoding: &ContentEncoding<'_>) -> String {
    match encoding {
        ContentEncoding::SevenBit => "7bit".to_string(),
        ContentEncoding::EightBit => "8bit".to_string(),
        ContentEncoding::Binary => "binary".to_string(),
        ContentEncoding::Base64 => "base64".to_string(),
        ContentEncoding::QuotedPrintable => "quoted-printable".to_string(),
        ContentEncoding::Other(other) => other.to_ascii_lowercase(),
    }
}
