//! Message composer: `{{placeholder}}` substitution plus coupon and tracking
//! link injection. Pure; no I/O.

use std::collections::HashMap;
use std::ops::Range;

use url::Url;

use drip_core::config::ComposerConfig;
use drip_core::types::{FlowMessage, FlowStatus};
use drip_core::{DripError, DripResult};

/// Characters that end a sentence rather than belong to a link. A trailing
/// `?` is kept as an empty query.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', '!', ';', ':', ')', '"', '\''];

#[derive(Debug, Clone)]
pub struct MessageComposer {
    config: ComposerConfig,
    link_base: Url,
    /// Scheme + host (+ port) of `link_base`; links starting with it are ours.
    origin: String,
}

impl MessageComposer {
    pub fn new(config: ComposerConfig) -> DripResult<Self> {
        let link_base = Url::parse(&config.link_base).map_err(|e| {
            DripError::Config(format!("invalid link base {}: {}", config.link_base, e))
        })?;
        let origin = link_base.origin().ascii_serialization();
        Ok(Self {
            config,
            link_base,
            origin,
        })
    }

    /// Render `message` for `status`.
    ///
    /// A coupon is only injected when the message asks for one and the row
    /// carries a code; a missing code is not an error.
    pub fn compose(&self, message: &FlowMessage, status: &FlowStatus) -> String {
        let body = substitute(&message.template, &status.metadata);
        let tag = message
            .link_tag
            .as_deref()
            .unwrap_or(&self.config.default_tag);

        let coupon = if message.includes_coupon {
            status.coupon_code.as_deref()
        } else {
            None
        };

        match coupon {
            Some(code) => match self.find_link(&body) {
                Some(range) => self.extend_link(&body, range, code),
                None => append(&body, &self.fresh_link(tag, Some(code))),
            },
            None if message.includes_link && self.find_link(&body).is_none() => {
                append(&body, &self.fresh_link(tag, None))
            }
            None => body,
        }
    }

    /// Byte range of the first link in `body` that points at our origin.
    fn find_link(&self, body: &str) -> Option<Range<usize>> {
        let mut from = 0;
        while let Some(idx) = body[from..].find(&self.origin) {
            let start = from + idx;
            let after = start + self.origin.len();

            let starts_token = body[..start]
                .chars()
                .next_back()
                .map_or(true, |c| c.is_whitespace() || c == '(' || c == '<');
            let end = body[start..]
                .find(char::is_whitespace)
                .map_or(body.len(), |i| start + i);
            let link = body[start..end].trim_end_matches(TRAILING_PUNCTUATION);
            let same_host = link.len() >= self.origin.len()
                && link
                    .as_bytes()
                    .get(self.origin.len())
                    .copied()
                    .map_or(true, |b| matches!(b, b'/' | b'?' | b'#'));

            if starts_token && same_host {
                return Some(start..start + link.len());
            }
            from = after;
        }
        None
    }

    fn extend_link(&self, body: &str, range: Range<usize>, code: &str) -> String {
        let link = &body[range.clone()];
        // The coupon joins the query, which ends where the fragment starts.
        let query_end = range.start + link.find('#').unwrap_or(link.len());
        let head = &body[range.start..query_end];
        let separator = if head.ends_with('?') || head.ends_with('&') {
            ""
        } else if head.contains('?') {
            "&"
        } else {
            "?"
        };
        let encoded: String = url::form_urlencoded::byte_serialize(code.as_bytes()).collect();

        let mut out = String::with_capacity(body.len() + encoded.len() + 16);
        out.push_str(&body[..query_end]);
        out.push_str(separator);
        out.push_str(&self.config.coupon_param);
        out.push('=');
        out.push_str(&encoded);
        out.push_str(&body[query_end..]);
        out
    }

    fn fresh_link(&self, tag: &str, coupon: Option<&str>) -> String {
        let mut link = self.link_base.clone();
        {
            let mut query = link.query_pairs_mut();
            query.append_pair(&self.config.tag_param, tag);
            if let Some(code) = coupon {
                query.append_pair(&self.config.coupon_param, code);
            }
        }
        link.into()
    }
}

/// Replace `{{key}}` with `vars[key]`. Unknown keys stay verbatim.
fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                match vars.get(after[..end].trim()) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + end + 4]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn append(body: &str, link: &str) -> String {
    let trimmed = body.trim_end();
    if trimmed.is_empty() {
        link.to_string()
    } else {
        format!("{} {}", trimmed, link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drip_core::types::{FlowId, MessageDelay, Subscriber};
    use uuid::Uuid;

    fn composer() -> MessageComposer {
        MessageComposer::new(ComposerConfig {
            link_base: "https://service".to_string(),
            ..ComposerConfig::default()
        })
        .unwrap()
    }

    fn message(template: &str, includes_coupon: bool) -> FlowMessage {
        FlowMessage {
            id: Uuid::new_v4(),
            flow_id: FlowId::from("welcome"),
            sequence: 1,
            template: template.to_string(),
            delay: MessageDelay::default(),
            includes_coupon,
            includes_link: false,
            link_tag: None,
            active: true,
        }
    }

    fn status(coupon: Option<&str>) -> FlowStatus {
        let now = Utc::now();
        let mut s = FlowStatus::enroll(
            Subscriber::new("+15550001111"),
            FlowId::from("welcome"),
            now,
            now,
        )
        .with_coupon(coupon.map(String::from));
        s.metadata.insert("name".to_string(), "Ada".to_string());
        s
    }

    #[test]
    fn test_substitutes_known_placeholders() {
        let out = composer().compose(&message("Hi {{name}}!", false), &status(None));
        assert_eq!(out, "Hi Ada!");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let out = composer().compose(
            &message("Hi {{ name }}, see {{city}} and {{unclosed", false),
            &status(None),
        );
        assert_eq!(out, "Hi Ada, see {{city}} and {{unclosed");
    }

    #[test]
    fn test_coupon_appended_to_existing_query() {
        let out = composer().compose(
            &message("Claim it: https://service/path?x=1", true),
            &status(Some("SAVE15")),
        );
        assert_eq!(out, "Claim it: https://service/path?x=1&coupon=SAVE15");
    }

    #[test]
    fn test_coupon_starts_query_when_absent() {
        let out = composer().compose(
            &message("Claim it: https://service/path", true),
            &status(Some("SAVE15")),
        );
        assert_eq!(out, "Claim it: https://service/path?coupon=SAVE15");
    }

    #[test]
    fn test_coupon_inserted_before_trailing_punctuation() {
        let out = composer().compose(
            &message("Go to https://service/path. Thanks!", true),
            &status(Some("SAVE15")),
        );
        assert_eq!(out, "Go to https://service/path?coupon=SAVE15. Thanks!");
    }

    #[test]
    fn test_coupon_goes_before_fragment() {
        let c = composer();
        let code = status(Some("SAVE15"));
        assert_eq!(
            c.compose(&message("See https://service/path#top now", true), &code),
            "See https://service/path?coupon=SAVE15#top now"
        );
        assert_eq!(
            c.compose(&message("See https://service/path?x=1#top.", true), &code),
            "See https://service/path?x=1&coupon=SAVE15#top."
        );
    }

    #[test]
    fn test_trailing_question_mark_is_empty_query() {
        let out = composer().compose(
            &message("Ready? https://service/path?", true),
            &status(Some("SAVE15")),
        );
        assert_eq!(out, "Ready? https://service/path?coupon=SAVE15");
    }

    #[test]
    fn test_fresh_link_when_template_has_none() {
        let out = composer().compose(&message("You won, {{name}}!", true), &status(Some("WINNER100")));
        assert_eq!(
            out,
            "You won, Ada! https://service/?ref=sms&coupon=WINNER100"
        );
    }

    #[test]
    fn test_fresh_link_uses_message_tag() {
        let mut msg = message("Hello", true);
        msg.link_tag = Some("promo_march".to_string());
        let out = composer().compose(&msg, &status(Some("X1")));
        assert!(out.ends_with("?ref=promo_march&coupon=X1"));
    }

    #[test]
    fn test_foreign_links_are_not_ours() {
        let out = composer().compose(
            &message("See https://service.evil.com/x and https://other/y", true),
            &status(Some("C1")),
        );
        assert!(out.starts_with("See https://service.evil.com/x and https://other/y "));
        assert!(out.ends_with("https://service/?ref=sms&coupon=C1"));
    }

    #[test]
    fn test_coupon_flag_without_code_is_silent() {
        let out = composer().compose(&message("Hi {{name}}", true), &status(None));
        assert_eq!(out, "Hi Ada");
    }

    #[test]
    fn test_coupon_ignored_when_not_requested() {
        let out = composer().compose(&message("Hi", false), &status(Some("SAVE15")));
        assert_eq!(out, "Hi");
    }

    #[test]
    fn test_link_only_message() {
        let mut msg = message("Check out new talent", false);
        msg.includes_link = true;
        let out = composer().compose(&msg, &status(None));
        assert_eq!(out, "Check out new talent https://service/?ref=sms");

        // An existing link is left as is.
        msg.template = "See https://service/talent".to_string();
        assert_eq!(composer().compose(&msg, &status(None)), "See https://service/talent");
    }

    #[test]
    fn test_invalid_link_base_is_config_error() {
        let err = MessageComposer::new(ComposerConfig {
            link_base: "not a url".to_string(),
            ..ComposerConfig::default()
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
