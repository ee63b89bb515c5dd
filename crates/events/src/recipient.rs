use serde::{Deserialize, Serialize};

/// Who a reward and its notification are addressed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Recipient {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            phone: None,
        }
    }

    pub fn phone(phone: impl Into<String>) -> Self {
        Self {
            email: None,
            phone: Some(phone.into()),
        }
    }

    /// At least one non-blank contact point.
    pub fn is_reachable(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.email) || present(&self.phone)
    }

    /// Address for a notification channel (`email` or `sms`).
    pub fn address_for(&self, channel: &str) -> Option<&str> {
        match channel {
            "email" => self.email.as_deref(),
            "sms" => self.phone.as_deref(),
            _ => None,
        }
    }
}
