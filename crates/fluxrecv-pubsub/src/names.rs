use std::fmt;

/// Fully qualified `projects/{project}/subscriptions/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionName(String);

/// Fully qualified `projects/{project}/topics/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

fn qualify(project: &str, collection: &str, id: &str) -> String {
    if id.starts_with("projects/") {
        id.to_string()
    } else {
        format!("projects/{project}/{collection}/{id}")
    }
}

impl SubscriptionName {
    /// Accepts a short id or an already qualified resource name.
    pub fn new(project: &str, id: &str) -> Self {
        Self(qualify(project, "subscriptions", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The trailing id segment.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl TopicName {
    pub fn new(project: &str, id: &str) -> Self {
        Self(qualify(project, "topics", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
