use crate::app::AppType;
use crate::error::{Error, Result};

/// Topic prefix to owning stream.
const STREAM_PREFIXES: &[(&str, &str)] = &[
    ("user.", "user"),
    ("leaderboard.", "leaderboard"),
    ("round.", "round"),
    ("score.", "score"),
    ("guild.", "guild"),
    ("discord.", "discord"),
    ("auth.", "auth"),
    ("club.", "club"),
    ("delayed.", "delayed"),
];

/// Resolves the stream that owns `topic`.
///
/// # Errors
///
/// Returns [`Error::UnknownTopic`] when no stream owns the topic's prefix.
pub fn stream_for_topic(topic: &str) -> Result<&'static str> {
    STREAM_PREFIXES
        .iter()
        .find(|(prefix, _)| topic.starts_with(prefix))
        .map(|(_, stream)| *stream)
        .ok_or_else(|| Error::UnknownTopic(topic.to_string()))
}

/// Subject filter captured by a stream.
#[must_use]
pub fn stream_subject(stream_key: &str) -> String {
    format!("{stream_key}.>")
}

/// Makes a topic safe for use inside a consumer name.
#[must_use]
pub fn sanitize(topic: &str) -> String {
    topic
        .replace('.', "-")
        .replace('*', "star")
        .replace('>', "all")
}

/// Deterministic durable consumer name for a role and topic.
#[must_use]
pub fn durable_name(app_type: AppType, topic: &str) -> String {
    format!("{}-{}", app_type.as_str(), sanitize(topic))
}

/// NATS subject matching: `*` matches one token, a trailing `>` matches one or more.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return filter_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(f), Some(s)) if f == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Role-based topic authorization, applied to both publish and subscribe.
#[derive(Clone, Debug)]
pub struct TopicPolicy {
    app_type: AppType,
    forbidden_prefixes: Vec<String>,
}

impl TopicPolicy {
    /// Creates a policy forbidding the given prefixes for `app_type`.
    #[must_use]
    pub const fn new(app_type: AppType, forbidden_prefixes: Vec<String>) -> Self {
        Self {
            app_type,
            forbidden_prefixes,
        }
    }

    /// The role's default policy.
    #[must_use]
    pub fn for_app(app_type: AppType) -> Self {
        Self::new(app_type, app_type.default_forbidden_prefixes())
    }

    /// Role this policy applies to.
    #[must_use]
    pub const fn app_type(&self) -> AppType {
        self.app_type
    }

    /// Checks that the role may use `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] if the topic starts with a forbidden prefix.
    pub fn authorize(&self, topic: &str) -> Result<()> {
        if self
            .forbidden_prefixes
            .iter()
            .any(|prefix| topic.starts_with(prefix.as_str()))
        {
            return Err(Error::Forbidden {
                app_type: self.app_type,
                topic: topic.to_string(),
            });
        }

        Ok(())
    }
}
