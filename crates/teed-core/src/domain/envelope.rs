//! Envelope - a raw broker message before it is admitted as a task.

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content-type label + opaque body, exactly as the broker delivered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(content_type: Option<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type,
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(JSON_CONTENT_TYPE.to_string()), body)
    }

    /// True when the media type is `application/json`, ignoring parameters
    /// such as `charset` and letter case.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|media| media.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
    }

    /// Lossy UTF-8 view of the body, for logs.
    pub fn body_preview(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.body);
        if text.chars().count() <= max {
            text.into_owned()
        } else {
            let cut: String = text.chars().take(max).collect();
            format!("{cut}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain(Some("application/json"), true)]
    #[case::charset(Some("application/json; charset=utf-8"), true)]
    #[case::upper(Some("Application/JSON"), true)]
    #[case::text(Some("text/plain"), false)]
    #[case::json_like(Some("application/jsonl"), false)]
    #[case::absent(None, false)]
    fn json_detection(#[case] ct: Option<&str>, #[case] expected: bool) {
        let env = Envelope::new(ct.map(str::to_string), "{}");
        assert_eq!(env.is_json(), expected);
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let env = Envelope::new(None, "abcdef");
        assert_eq!(env.body_preview(3), "abc...");
        assert_eq!(env.body_preview(10), "abcdef");
    }
}
