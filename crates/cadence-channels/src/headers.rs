//! Raw RFC 5322 headers → [`FeedMessage`].
//!
//! IMAP has no provider thread id, so the thread is the root of the
//! References chain (falling back to In-Reply-To). Outbound mail uses its own
//! Message-ID as thread root, so both sides agree.

use cadence_core::types::FeedMessage;
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};

fn strip_brackets(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn text_list(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(s) => s.split_whitespace().map(strip_brackets).collect(),
        HeaderValue::TextList(list) => list.iter().map(|s| strip_brackets(s)).collect(),
        _ => Vec::new(),
    }
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect()
}

/// Parse a header block (or full message). `id` is the provider-unique id
/// used for dedupe, `labels` the folder(s) it was read from.
pub fn parse_headers(raw: &[u8], id: String, labels: Vec<String>) -> Option<FeedMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|a| a.first())
        .map(|a| match (a.name(), a.address()) {
            (Some(name), Some(addr)) => format!("{name} <{addr}>"),
            (_, Some(addr)) => addr.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .unwrap_or_default();

    let to = parsed
        .to()
        .map(|a| a.iter().filter_map(|addr| addr.address()).map(str::to_string).collect())
        .unwrap_or_default();

    let in_reply_to = text_list(parsed.in_reply_to());
    let references = text_list(parsed.references());
    let thread_id = references.first().or_else(|| in_reply_to.first()).cloned();

    let (content_type, report_type) = match parsed.content_type() {
        Some(ct) => {
            let full = match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            };
            let report = ct.attribute("report-type").map(|r| {
                if r.contains('/') {
                    r.to_lowercase()
                } else {
                    format!("message/{}", r.to_lowercase())
                }
            });
            (Some(full.to_lowercase()), report)
        }
        None => (None, None),
    };

    let failed_recipients = parsed
        .header_raw("X-Failed-Recipients")
        .map(|raw| {
            raw.split(',')
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(FeedMessage {
        id,
        thread_id,
        labels,
        from,
        to,
        subject: parsed.subject().unwrap_or_default().to_string(),
        message_id: parsed.message_id().map(strip_brackets),
        in_reply_to,
        references,
        content_type,
        report_type,
        failed_recipients,
        auto_submitted: parsed.header_raw("Auto-Submitted").map(|v| v.trim().to_string()),
    })
}
