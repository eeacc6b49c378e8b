use async_trait::async_trait;
use std::sync::Arc;

use super::{MembershipError, MembershipSource, Observer, Subject};

/// Fixed backend list. `update_conf` still replaces it, which is how the CLI and tests
/// simulate membership changes.
pub struct StaticListSource {
    subject: Subject,
}

impl StaticListSource {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            subject: Subject::new(entries),
        }
    }
}

#[async_trait]
impl MembershipSource for StaticListSource {
    fn get_conf(&self) -> Vec<String> {
        self.subject.entries()
    }

    fn attach(&self, observer: Arc<dyn Observer>) {
        self.subject.attach(observer);
    }

    async fn watch_conf(&self) -> Result<(), MembershipError> {
        Ok(())
    }

    fn update_conf(&self, conf: Vec<String>) {
        tracing::debug!(entries = ?conf, "Static membership replaced");
        self.subject.publish(conf);
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
