use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Group, GroupId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, From, Display, Deref, FromStr,
)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    User,
    Smtp,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Smtp => "smtp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(AccountType::User),
            "smtp" => Some(AccountType::Smtp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "suspended" => Some(UserStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub username: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
    pub account_type: AccountType,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub status: UserStatus,
    /// Sender domains this account may use in MAIL FROM. An empty set denies
    /// everything unless the group opts into `allow_any_sender`.
    pub allowed_domains: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn verify_password(&self, password: &str) -> bool {
        password_auth::verify_password(password.as_bytes(), &self.password_hash).is_ok()
    }

    pub fn is_active_smtp(&self) -> bool {
        self.account_type == AccountType::Smtp && self.status == UserStatus::Active
    }

    /// The MAIL FROM gate: domain comparison is case-insensitive, the empty
    /// set denies unless the tenant opted in.
    pub fn sender_domain_allowed(&self, group: &Group, domain: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return group.allow_any_sender;
        }
        self.allowed_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
    pub account_type: AccountType,
    /// Required for smtp accounts: the one group the account submits for.
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl NewUser {
    pub fn password_hash(&self) -> String {
        password_auth::generate_hash(self.password.as_bytes())
    }
}

pub fn generate_api_key() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 40)
}

#[cfg(test)]
mod test {
    use super::*;

    fn group(allow_any_sender: bool) -> Group {
        Group {
            id: GroupId::random(),
            name: "acme".into(),
            status: super::super::GroupStatus::Active,
            allow_any_sender,
            fallback_providers: vec![],
            monthly_limit: 1000,
            monthly_sent: 0,
            created_at: Utc::now(),
        }
    }

    fn smtp_user(allowed_domains: Vec<String>) -> User {
        User {
            id: UserId::random(),
            email: "sender@acme.test".into(),
            username: Some("sender".into()),
            password_hash: password_auth::generate_hash(b"pw"),
            account_type: AccountType::Smtp,
            api_key: Some(generate_api_key()),
            status: UserStatus::Active,
            allowed_domains,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn password_round_trip() {
        let user = smtp_user(vec![]);
        assert!(user.verify_password("pw"));
        assert!(!user.verify_password("not-pw"));
    }

    #[test]
    fn empty_allowed_set_denies_by_default() {
        let user = smtp_user(vec![]);
        assert!(!user.sender_domain_allowed(&group(false), "example.com"));
        assert!(user.sender_domain_allowed(&group(true), "example.com"));
    }

    #[test]
    fn allowed_domain_match_is_case_insensitive() {
        let user = smtp_user(vec!["Example.COM".into()]);
        assert!(user.sender_domain_allowed(&group(false), "example.com"));
        assert!(!user.sender_domain_allowed(&group(false), "other.com"));
    }
}
