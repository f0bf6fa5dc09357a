//! Profile source — organization and user free text injected into the prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Free-text profile fields for one user within one organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A labelled profile field handed to the context assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileField {
    pub label: String,
    pub text: String,
}

impl Profile {
    /// Non-empty fields, least important first (truncated first under pressure).
    pub fn fields(&self) -> Vec<ProfileField> {
        [("Company profile", &self.company), ("User profile", &self.user)]
            .into_iter()
            .filter_map(|(label, text)| {
                text.as_ref()
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| ProfileField {
                        label: label.to_string(),
                        text: t.clone(),
                    })
            })
            .collect()
    }
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Load the profile for a user. Unknown users get an empty profile.
    async fn load(&self, user_id: &str, org_id: &str) -> Profile;
}

/// One configured profile entry. `user_id: None` applies to every user of the org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub org_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Profiles defined up front (configuration, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    entries: Vec<ProfileEntry>,
}

impl StaticProfiles {
    pub fn new(entries: Vec<ProfileEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn load(&self, user_id: &str, org_id: &str) -> Profile {
        let org_entries = self.entries.iter().filter(|e| e.org_id == org_id);
        let mut profile = Profile::default();
        let mut matched_user = false;
        for entry in org_entries {
            let exact = entry.user_id.as_deref() == Some(user_id);
            if entry.user_id.is_some() && !exact {
                continue;
            }
            if profile.company.is_none() {
                profile.company = entry.company.clone();
            }
            if exact || !matched_user {
                if let Some(text) = &entry.user {
                    profile.user = Some(text.clone());
                    matched_user |= exact;
                }
            }
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ProfileEntry> {
        vec![
            ProfileEntry {
                org_id: "acme".into(),
                user_id: None,
                company: Some("Acme builds anvils.".into()),
                user: Some("A generic Acme employee.".into()),
            },
            ProfileEntry {
                org_id: "acme".into(),
                user_id: Some("wile".into()),
                company: None,
                user: Some("Prefers rockets.".into()),
            },
        ]
    }

    #[tokio::test]
    async fn user_specific_entry_wins() {
        let profiles = StaticProfiles::new(entries());
        let p = profiles.load("wile", "acme").await;
        assert_eq!(p.company.as_deref(), Some("Acme builds anvils."));
        assert_eq!(p.user.as_deref(), Some("Prefers rockets."));
    }

    #[tokio::test]
    async fn org_default_applies_to_other_users() {
        let profiles = StaticProfiles::new(entries());
        let p = profiles.load("road", "acme").await;
        assert_eq!(p.user.as_deref(), Some("A generic Acme employee."));
    }

    #[tokio::test]
    async fn unknown_org_is_empty() {
        let p = StaticProfiles::new(entries()).load("x", "globex").await;
        assert_eq!(p, Profile::default());
        assert!(p.fields().is_empty());
    }

    #[test]
    fn fields_are_ordered_least_important_first() {
        let p = Profile {
            company: Some("c".into()),
            user: Some("u".into()),
        };
        let labels: Vec<String> = p.fields().into_iter().map(|f| f.label).collect();
        assert_eq!(labels, vec!["Company profile", "User profile"]);
    }
}
