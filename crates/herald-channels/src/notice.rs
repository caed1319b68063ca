//! Deployment notices
//!
//! Protocol-neutral rendering of "deployment in progress" and "deployment
//! finished" announcements. Discord turns a [`Notice`] into an embed, IRC
//! flattens it into a single line.

use chrono::{DateTime, Utc};
use herald_core::types::DeploymentUpdate;

const COLOR_IN_PROGRESS: u32 = 0xF1C40F;
const COLOR_SUCCEEDED: u32 = 0x2ECC71;
const COLOR_FAILED: u32 = 0xE74C3C;

/// Build output longer than this is cut from the front
const MAX_OUTPUT_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// A rich announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<NoticeField>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notice {
    /// Announcement posted when a deployment starts
    pub fn deployment_started(update: &DeploymentUpdate) -> Self {
        let mut notice = Self {
            title: "Deployment In Progress".to_string(),
            description: format!(
                "Compiling revision {} against engine {}.",
                update.revision.short_sha(),
                update.engine_version
            ),
            color: COLOR_IN_PROGRESS,
            fields: revision_fields(update),
            footer: None,
            timestamp: Some(Utc::now()),
        };
        if let Some(eta) = update.estimated_completion {
            notice.push_field("ETA", eta.format("%Y-%m-%d %H:%M UTC").to_string(), true);
        }
        notice
    }

    /// Announcement replacing the in-progress notice once the deployment ended
    pub fn deployment_finished(
        update: &DeploymentUpdate,
        error_message: Option<&str>,
        build_output: Option<&str>,
    ) -> Self {
        let (title, description, color) = match error_message {
            Some(error) => (
                "Deployment Failed",
                format!("The deployment failed: {}", error),
                COLOR_FAILED,
            ),
            None => (
                "Deployment Succeeded",
                "The deployment completed successfully and will be applied on the next server reboot."
                    .to_string(),
                COLOR_SUCCEEDED,
            ),
        };

        let mut notice = Self {
            title: title.to_string(),
            description,
            color,
            fields: revision_fields(update),
            footer: None,
            timestamp: Some(Utc::now()),
        };
        if let Some(output) = build_output.filter(|o| !o.trim().is_empty()) {
            notice.push_field("Build Output", format!("```\n{}\n```", tail(output, MAX_OUTPUT_CHARS)), false);
        }
        notice
    }

    pub fn push_field(&mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) {
        self.fields.push(NoticeField {
            name: name.into(),
            value: value.into(),
            inline,
        });
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    /// Single line rendering for line-oriented protocols
    pub fn to_plain_text(&self) -> String {
        let mut parts = vec![format!("[{}] {}", self.title, self.description)];
        for field in &self.fields {
            // Code blocks only make sense in rich clients
            if field.value.starts_with("```") {
                continue;
            }
            parts.push(format!("{}: {}", field.name, field.value));
        }
        parts.join(" | ")
    }
}

fn revision_fields(update: &DeploymentUpdate) -> Vec<NoticeField> {
    let revision = &update.revision;
    let mut revision_text = revision.short_sha().to_string();
    if revision.is_local_commit() {
        revision_text.push_str(if update.local_commit_pushed {
            " (local commit, pushed)"
        } else {
            " (local commit)"
        });
    }

    let mut fields = vec![
        NoticeField {
            name: "Revision".to_string(),
            value: revision_text,
            inline: true,
        },
        NoticeField {
            name: "Engine Version".to_string(),
            value: update.engine_version.clone(),
            inline: true,
        },
    ];

    for merge in &revision.test_merges {
        let sha: String = merge.target_commit_sha.chars().take(7).collect();
        let mut value = format!("{} by {} at {}", merge.title, merge.author, sha);
        if let Some(url) = &merge.url {
            value.push_str(&format!(" ({})", url));
        }
        fields.push(NoticeField {
            name: format!("Test Merge #{}", merge.number),
            value,
            inline: false,
        });
    }
    fields
}

/// Keep the last `max` characters, where compiler errors usually are
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max).collect();
    format!("...{}", skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{RevisionInfo, TestMerge};

    fn update(sha: &str, origin: &str) -> DeploymentUpdate {
        DeploymentUpdate {
            revision: RevisionInfo {
                commit_sha: sha.to_string(),
                origin_commit_sha: origin.to_string(),
                timestamp: Utc::now(),
                test_merges: vec![TestMerge {
                    number: 42,
                    title: "Fix lighting".to_string(),
                    author: "octocat".to_string(),
                    url: None,
                    target_commit_sha: "fedcba9876543210".to_string(),
                }],
            },
            engine_version: "515.1630".to_string(),
            estimated_completion: None,
            real_id: 1,
            local_commit_pushed: false,
        }
    }

    #[test]
    fn test_started_notice_fields() {
        let notice = Notice::deployment_started(&update("0123456789", "0123456789"));
        assert_eq!(notice.color, COLOR_IN_PROGRESS);
        assert_eq!(notice.fields[0].value, "0123456");
        assert_eq!(notice.fields[1].value, "515.1630");
        assert_eq!(notice.fields[2].name, "Test Merge #42");
        assert!(notice.fields[2].value.contains("fedcba9"));
    }

    #[test]
    fn test_local_commit_marker() {
        let mut u = update("aaaaaaaaa", "bbbbbbbbb");
        assert!(Notice::deployment_started(&u).fields[0].value.ends_with("(local commit)"));
        u.local_commit_pushed = true;
        assert!(Notice::deployment_started(&u).fields[0].value.ends_with("(local commit, pushed)"));
    }

    #[test]
    fn test_finished_notice_failure() {
        let notice = Notice::deployment_finished(&update("a", "a"), Some("compile error"), Some("line 1\nline 2"));
        assert_eq!(notice.title, "Deployment Failed");
        assert_eq!(notice.color, COLOR_FAILED);
        assert!(notice.description.contains("compile error"));
        assert!(notice.fields.iter().any(|f| f.name == "Build Output"));
    }

    #[test]
    fn test_finished_notice_success_without_output() {
        let notice = Notice::deployment_finished(&update("a", "a"), None, None);
        assert_eq!(notice.title, "Deployment Succeeded");
        assert!(notice.fields.iter().all(|f| f.name != "Build Output"));
    }

    #[test]
    fn test_plain_text_skips_code_blocks() {
        let notice = Notice::deployment_finished(&update("abc", "abc"), Some("boom"), Some("output"));
        let text = notice.to_plain_text();
        assert!(text.starts_with("[Deployment Failed]"));
        assert!(!text.contains("```"));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_tail_truncates_front() {
        assert_eq!(tail("abcdef", 3), "...def");
        assert_eq!(tail("abc", 3), "abc");
    }
}
