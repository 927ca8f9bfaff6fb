//! Deployment notification rules

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::SpecError;

const ALL_EVENTS: &str = "*";

/// Events that can be sent to notification receivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEventType {
    DeploymentTriggered,
    DeploymentPlanned,
    DeploymentApproved,
    DeploymentWaitApproval,
    DeploymentRollingBack,
    DeploymentSucceeded,
    DeploymentFailed,
    DeploymentCancelled,
}

impl NotificationEventType {
    pub const ALL: [NotificationEventType; 8] = [
        Self::DeploymentTriggered,
        Self::DeploymentPlanned,
        Self::DeploymentApproved,
        Self::DeploymentWaitApproval,
        Self::DeploymentRollingBack,
        Self::DeploymentSucceeded,
        Self::DeploymentFailed,
        Self::DeploymentCancelled,
    ];

    /// Name without the `EVENT_` prefix, as written in mentions
    pub fn name(self) -> &'static str {
        match self {
            Self::DeploymentTriggered => "DEPLOYMENT_TRIGGERED",
            Self::DeploymentPlanned => "DEPLOYMENT_PLANNED",
            Self::DeploymentApproved => "DEPLOYMENT_APPROVED",
            Self::DeploymentWaitApproval => "DEPLOYMENT_WAIT_APPROVAL",
            Self::DeploymentRollingBack => "DEPLOYMENT_ROLLING_BACK",
            Self::DeploymentSucceeded => "DEPLOYMENT_SUCCEEDED",
            Self::DeploymentFailed => "DEPLOYMENT_FAILED",
            Self::DeploymentCancelled => "DEPLOYMENT_CANCELLED",
        }
    }

    pub fn event_name(self) -> String {
        format!("EVENT_{}", self.name())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("EVENT_").unwrap_or(name);
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentNotification {
    #[serde(default)]
    pub mentions: Vec<NotificationMention>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMention {
    pub event: String,
    /// Deprecated alias of `slackusers`
    #[serde(default)]
    pub slack: Vec<String>,
    #[serde(default, rename = "slackusers")]
    pub slack_users: Vec<String>,
    #[serde(default, rename = "slackgroups")]
    pub slack_groups: Vec<String>,
    #[serde(default)]
    pub email: Vec<String>,
}

impl NotificationMention {
    fn applies_to(&self, event: NotificationEventType) -> bool {
        self.event == ALL_EVENTS || format!("EVENT_{}", self.event) == event.event_name()
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.event == ALL_EVENTS || NotificationEventType::from_name(&self.event).is_some() {
            return Ok(());
        }
        Err(SpecError::invalid(format!(
            "event {:?} is incorrect as NotificationEventType",
            self.event
        )))
    }
}

impl DeploymentNotification {
    pub fn validate(&self) -> Result<(), SpecError> {
        self.mentions.iter().try_for_each(NotificationMention::validate)
    }

    /// Slack user IDs to mention for the event, deduplicated
    pub fn find_slack_users(&self, event: NotificationEventType) -> Vec<String> {
        let users: BTreeSet<&String> = self
            .mentions
            .iter()
            .filter(|m| m.applies_to(event))
            .flat_map(|m| m.slack.iter().chain(m.slack_users.iter()))
            .collect();
        users.into_iter().cloned().collect()
    }

    /// Slack group IDs to mention for the event, deduplicated
    pub fn find_slack_groups(&self, event: NotificationEventType) -> Vec<String> {
        let groups: BTreeSet<&String> = self
            .mentions
            .iter()
            .filter(|m| m.applies_to(event))
            .flat_map(|m| m.slack_groups.iter())
            .collect();
        groups.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention(event: &str, users: &[&str]) -> NotificationMention {
        NotificationMention {
            event: event.into(),
            slack_users: users.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_find_slack_users_by_event() {
        let n = DeploymentNotification {
            mentions: vec![
                mention("DEPLOYMENT_FAILED", &["oncall"]),
                mention("*", &["lead", "oncall"]),
                mention("DEPLOYMENT_PLANNED", &["reviewer"]),
            ],
        };
        assert_eq!(
            n.find_slack_users(NotificationEventType::DeploymentFailed),
            vec!["lead".to_string(), "oncall".to_string()]
        );
        assert_eq!(
            n.find_slack_users(NotificationEventType::DeploymentSucceeded),
            vec!["lead".to_string(), "oncall".to_string()]
        );
    }

    #[test]
    fn test_mention_event_must_be_known() {
        assert!(mention("*", &[]).validate().is_ok());
        assert!(mention("DEPLOYMENT_CANCELLED", &[]).validate().is_ok());
        assert!(mention("DEPLOYMENT_EXPLODED", &[]).validate().is_err());
    }
}
