//! Issue tracker integration.
//!
//! The HTTP layer talks to an `IssueTracker`; Jira is the only
//! implementation. Tests substitute a fake.

pub mod jira;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use jira::{JiraClient, JiraError};

static ISSUE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]+-\d+$").expect("issue key pattern is valid"));

/// A field update and/or a comment for one issue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueUpdate {
    pub issue_key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl IssueUpdate {
    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Comment text, if any was given.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref().filter(|c| !c.is_empty())
    }

    /// Checks the key shape and that there is something to send.
    pub fn validate(&self) -> Result<(), String> {
        let key = &self.issue_key;
        if !(3..=32).contains(&key.len()) {
            return Err(format!(
                "issue_key must be 3 to 32 characters long, got {}",
                key.len()
            ));
        }
        if !ISSUE_KEY.is_match(key) {
            return Err(format!("issue_key {key:?} does not look like PROJECT-123"));
        }
        if !self.has_fields() && self.comment().is_none() {
            return Err("At least one of fields or comment must be provided.".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueUpdateOutcome {
    pub issue_key: String,
    pub fields_updated: bool,
    pub comment_added: bool,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Applies the field update first, then posts the comment. Stops at the
    /// first failure, so fields may be updated even when the comment fails.
    async fn update_issue(&self, update: &IssueUpdate) -> Result<IssueUpdateOutcome, JiraError>;

    fn name(&self) -> &str;
}
