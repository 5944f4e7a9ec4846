//! Source platform tags and platform-aware error classification.
//!
//! The supported platform set is fixed and finite, so per-platform
//! behavior is dispatched over a closed enum rather than any form of
//! dynamic registration. Classification turns a raw upstream error
//! string into a user-facing message plus retry guidance, so the front
//! end can render help without this layer knowing about UI concerns.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Source platform of a submitted URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Twitter,
    Tiktok,
    Instagram,
    Facebook,
    Vimeo,
    /// Anything not recognized above
    #[default]
    Generic,
}

impl Platform {
    /// Detect the platform from a source URL.
    pub fn detect(url: &str) -> Self {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_else(|| url.to_ascii_lowercase());

        if host.contains("youtube.com") || host.contains("youtu.be") {
            Platform::Youtube
        } else if host.contains("twitter.com") || host == "x.com" || host.ends_with(".x.com") {
            Platform::Twitter
        } else if host.contains("tiktok.com") {
            Platform::Tiktok
        } else if host.contains("instagram.com") {
            Platform::Instagram
        } else if host.contains("facebook.com") || host.contains("fb.watch") {
            Platform::Facebook
        } else if host.contains("vimeo.com") {
            Platform::Vimeo
        } else {
            Platform::Generic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Twitter => "twitter",
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Vimeo => "vimeo",
            Platform::Generic => "generic",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(Platform::Youtube),
            "twitter" => Ok(Platform::Twitter),
            "tiktok" => Ok(Platform::Tiktok),
            "instagram" => Ok(Platform::Instagram),
            "facebook" => Ok(Platform::Facebook),
            "vimeo" => Ok(Platform::Vimeo),
            "generic" => Ok(Platform::Generic),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// Broad category of an upstream processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    VideoNotFound,
    VideoTooLong,
    NetworkError,
    ConversionFailed,
    RateLimitExceeded,
    ProcessingTimeout,
    ServerError,
}

/// Operational severity of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Result of classifying an upstream error string.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub platform: Platform,
    pub severity: Severity,
    /// Whether the same job is worth retrying
    pub retryable: bool,
    /// Message suitable for showing to the submitting user
    pub user_message: String,
    /// Optional recovery hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// One pattern table entry: match any of the needles (case-insensitive
/// substring) against the raw error, for the given platform or any.
struct Pattern {
    platform: Option<Platform>,
    needles: &'static [&'static str],
    kind: ErrorKind,
    severity: Severity,
    retryable: bool,
    user_message: &'static str,
    suggestion: Option<&'static str>,
}

const PATTERNS: &[Pattern] = &[
    Pattern {
        platform: Some(Platform::Youtube),
        needles: &[
            "sign in to confirm",
            "video unavailable",
            "this video is not available",
            "private video",
            "members-only",
        ],
        kind: ErrorKind::AccessDenied,
        severity: Severity::High,
        retryable: false,
        user_message: "This YouTube video requires sign-in or is private. Please use a public video.",
        suggestion: Some("Try a different public YouTube video, or a video from another platform."),
    },
    Pattern {
        platform: Some(Platform::Youtube),
        needles: &[
            "anti-bot",
            "bot detection",
            "too many requests",
            "rate limit",
            "temporarily restricted",
            "access from your location",
        ],
        kind: ErrorKind::AccessDenied,
        severity: Severity::Medium,
        retryable: true,
        user_message: "YouTube has temporarily restricted access. Please try again in a few minutes.",
        suggestion: Some("This restriction is usually temporary. Videos from other platforms may work immediately."),
    },
    Pattern {
        platform: Some(Platform::Youtube),
        needles: &["video too long", "duration exceeds", "maximum length"],
        kind: ErrorKind::VideoTooLong,
        severity: Severity::Medium,
        retryable: false,
        user_message: "This video is too long to convert. Please use a shorter video.",
        suggestion: Some("Try a video under 10 minutes, or the MP3 format for longer content."),
    },
    Pattern {
        platform: Some(Platform::Twitter),
        needles: &[
            "tweet not found",
            "this tweet is unavailable",
            "protected tweets",
            "account suspended",
        ],
        kind: ErrorKind::VideoNotFound,
        severity: Severity::High,
        retryable: false,
        user_message: "This tweet is not available or has been deleted.",
        suggestion: Some("Check that the tweet exists and is public."),
    },
    Pattern {
        platform: Some(Platform::Twitter),
        needles: &["rate limit exceeded", "too many requests", "api limit"],
        kind: ErrorKind::RateLimitExceeded,
        severity: Severity::Low,
        retryable: true,
        user_message: "Twitter rate limit reached. Please wait a moment and try again.",
        suggestion: None,
    },
    Pattern {
        platform: Some(Platform::Tiktok),
        needles: &[
            "video not available",
            "content not found",
            "private account",
            "region blocked",
        ],
        kind: ErrorKind::VideoNotFound,
        severity: Severity::Medium,
        retryable: true,
        user_message: "This TikTok video is not available. It may be region-restricted or private.",
        suggestion: Some("Try a different TikTok video from a public account."),
    },
    Pattern {
        platform: Some(Platform::Instagram),
        needles: &[
            "login required",
            "private account",
            "content not available",
            "post not found",
        ],
        kind: ErrorKind::AccessDenied,
        severity: Severity::Medium,
        retryable: true,
        user_message: "This Instagram content requires login or is private.",
        suggestion: Some("Make sure the Instagram post is public. Private posts cannot be converted."),
    },
    Pattern {
        platform: None,
        needles: &[
            "network error",
            "connection timeout",
            "connection refused",
            "dns resolution failed",
            "ssl error",
            "certificate",
        ],
        kind: ErrorKind::NetworkError,
        severity: Severity::Medium,
        retryable: true,
        user_message: "A network problem interrupted the conversion. Please try again in a moment.",
        suggestion: None,
    },
    Pattern {
        platform: None,
        needles: &["timed out", "timeout"],
        kind: ErrorKind::ProcessingTimeout,
        severity: Severity::Medium,
        retryable: true,
        user_message: "Processing timed out. The worker may have stopped. Please try again.",
        suggestion: None,
    },
    Pattern {
        platform: None,
        needles: &[
            "conversion failed",
            "encoding error",
            "ffmpeg error",
            "format not supported",
        ],
        kind: ErrorKind::ConversionFailed,
        severity: Severity::Medium,
        retryable: true,
        user_message: "Conversion failed. Please try a different quality or format.",
        suggestion: Some("Selecting a lower quality often helps with problematic sources."),
    },
];

/// Classify an upstream error string for a given platform.
///
/// Falls back to a retryable server-error classification when no
/// pattern matches, so every failure carries a usable message.
pub fn classify_error(raw: &str, platform: Platform) -> ErrorClassification {
    let haystack = raw.to_ascii_lowercase();

    for pattern in PATTERNS {
        let platform_matches = match pattern.platform {
            Some(p) => p == platform,
            None => true,
        };
        if !platform_matches {
            continue;
        }
        if pattern.needles.iter().any(|n| haystack.contains(n)) {
            return ErrorClassification {
                kind: pattern.kind,
                platform,
                severity: pattern.severity,
                retryable: pattern.retryable,
                user_message: pattern.user_message.to_string(),
                suggestion: pattern.suggestion.map(str::to_string),
            };
        }
    }

    ErrorClassification {
        kind: ErrorKind::ServerError,
        platform,
        severity: Severity::Medium,
        retryable: true,
        user_message: "An unexpected error occurred during conversion. Please try again.".to_string(),
        suggestion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_platforms_from_urls() {
        assert_eq!(Platform::detect("https://www.youtube.com/watch?v=abc"), Platform::Youtube);
        assert_eq!(Platform::detect("https://youtu.be/abc"), Platform::Youtube);
        assert_eq!(Platform::detect("https://x.com/user/status/1"), Platform::Twitter);
        assert_eq!(Platform::detect("https://twitter.com/user/status/1"), Platform::Twitter);
        assert_eq!(Platform::detect("https://www.tiktok.com/@u/video/1"), Platform::Tiktok);
        assert_eq!(Platform::detect("https://www.instagram.com/p/xyz/"), Platform::Instagram);
        assert_eq!(Platform::detect("https://fb.watch/abc"), Platform::Facebook);
        assert_eq!(Platform::detect("https://vimeo.com/12345"), Platform::Vimeo);
        assert_eq!(Platform::detect("https://example.com/video.mp4"), Platform::Generic);
    }

    #[test]
    fn matrix_domain_is_not_twitter() {
        assert_eq!(Platform::detect("https://matrix.com/x"), Platform::Generic);
    }

    #[test]
    fn classifies_youtube_access_denied_as_fatal() {
        let c = classify_error("ERROR: Sign in to confirm your age", Platform::Youtube);
        assert_eq!(c.kind, ErrorKind::AccessDenied);
        assert!(!c.retryable);
        assert!(c.user_message.contains("YouTube"));
    }

    #[test]
    fn classifies_bot_detection_as_retryable() {
        let c = classify_error("HTTP 429: too many requests", Platform::Youtube);
        assert_eq!(c.kind, ErrorKind::AccessDenied);
        assert!(c.retryable);
    }

    #[test]
    fn platform_patterns_do_not_cross_platforms() {
        // A Twitter-specific pattern must not fire for a YouTube job.
        let c = classify_error("tweet not found", Platform::Youtube);
        assert_eq!(c.kind, ErrorKind::ServerError);
    }

    #[test]
    fn generic_patterns_apply_everywhere() {
        let c = classify_error("ffmpeg error: invalid data", Platform::Tiktok);
        assert_eq!(c.kind, ErrorKind::ConversionFailed);
        let c = classify_error("processing timed out after 600s", Platform::Vimeo);
        assert_eq!(c.kind, ErrorKind::ProcessingTimeout);
    }

    #[test]
    fn unknown_errors_fall_back_to_server_error() {
        let c = classify_error("segfault in module x", Platform::Generic);
        assert_eq!(c.kind, ErrorKind::ServerError);
        assert!(c.retryable);
        assert!(!c.user_message.is_empty());
    }
}
