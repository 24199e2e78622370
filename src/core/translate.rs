//! Message translation rules shared by the validator and the drivers
//!
//! Canonical chat threads allow at most one system message, only first, and
//! strict user/assistant alternation after it. Image parts are URLs; drivers
//! that need inline data fetch them here.

use crate::core::error::{GatewayError, Result};
use crate::core::types::{ChatMessage, Role};

/// MIME types accepted for inline images.
pub const IMAGE_MIMES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Enforce the canonical thread shape.
pub fn validate_thread(messages: &[ChatMessage]) -> Result<()> {
    let mut last: Option<Role> = None;
    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::System => {
                if i != 0 {
                    return Err(GatewayError::MisplacedSystem { index: i });
                }
            }
            Role::User | Role::Assistant => {
                if last == Some(msg.role) {
                    return Err(GatewayError::NotAlternating { index: i });
                }
                last = Some(msg.role);
            }
            other => {
                return Err(GatewayError::UnsupportedRole {
                    index: i,
                    role: other.to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Split off the leading system message, if any.
///
/// Assumes the thread passed [`validate_thread`].
pub fn split_system(messages: &[ChatMessage]) -> (Option<String>, &[ChatMessage]) {
    match messages.first() {
        Some(m) if m.role == Role::System => (Some(m.plain_text()), &messages[1..]),
        _ => (None, messages),
    }
}

/// Fetch an image URL and return its MIME type and bytes.
///
/// The request is aborted if the caller's future is dropped.
pub async fn fetch_image(client: &reqwest::Client, url: &str) -> Result<(String, Vec<u8>)> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_default();
    if !IMAGE_MIMES.contains(&mime.as_str()) {
        return Err(GatewayError::UnsupportedMime(mime));
    }
    let bytes = resp.bytes().await?;
    Ok((mime, bytes.to_vec()))
}

/// Infer a MIME type from a file extension, falling back to text.
pub fn mime_from_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "mp3" | "wav" | "mpeg" => "audio/mpeg",
        "mov" | "mp4" | "mpg" | "avi" | "wmv" | "flv" => "video/mp4",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role) -> ChatMessage {
        ChatMessage::text(role, "x")
    }

    #[test]
    fn accepts_canonical_threads() {
        validate_thread(&[msg(Role::User)]).unwrap();
        validate_thread(&[msg(Role::System), msg(Role::User)]).unwrap();
        validate_thread(&[
            msg(Role::System),
            msg(Role::User),
            msg(Role::Assistant),
            msg(Role::User),
        ])
        .unwrap();
    }

    #[test]
    fn rejects_misplaced_system() {
        let err = validate_thread(&[msg(Role::User), msg(Role::System)]).unwrap_err();
        assert!(matches!(err, GatewayError::MisplacedSystem { index: 1 }));
    }

    #[test]
    fn rejects_consecutive_roles() {
        let err = validate_thread(&[msg(Role::User), msg(Role::User)]).unwrap_err();
        assert!(matches!(err, GatewayError::NotAlternating { index: 1 }));
        let err = validate_thread(&[
            msg(Role::User),
            msg(Role::Assistant),
            msg(Role::Assistant),
        ])
        .unwrap_err();
        assert!(matches!(err, GatewayError::NotAlternating { index: 2 }));
    }

    #[test]
    fn rejects_foreign_roles() {
        let err = validate_thread(&[msg(Role::Tool)]).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedRole { index: 0, .. }));
    }

    #[test]
    fn splits_leading_system() {
        let thread = [msg(Role::System), msg(Role::User)];
        let (system, rest) = split_system(&thread);
        assert_eq!(system.as_deref(), Some("x"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn extension_mime() {
        assert_eq!(mime_from_extension("https://a.test/photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_extension("https://a.test/doc.pdf?x=1"), "application/pdf");
        assert_eq!(mime_from_extension("https://a.test/readme"), "text/plain");
    }
}
