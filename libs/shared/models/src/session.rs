use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Client,
    #[serde(rename = "SLP")]
    Slp,
    Audiologist,
    Both,
}

impl UserType {
    pub fn is_therapist(&self) -> bool {
        !matches!(self, UserType::Client)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Client => "CLIENT",
            UserType::Slp => "SLP",
            UserType::Audiologist => "AUDIOLOGIST",
            UserType::Both => "BOTH",
        }
    }

    pub fn therapist_types() -> [UserType; 3] {
        [UserType::Slp, UserType::Audiologist, UserType::Both]
    }
}

impl FromStr for UserType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CLIENT" => Ok(UserType::Client),
            "SLP" => Ok(UserType::Slp),
            "AUDIOLOGIST" => Ok(UserType::Audiologist),
            "BOTH" => Ok(UserType::Both),
            other => Err(format!("unknown user type '{}'", other)),
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Profile data of the signed-in user, copied into documents the user sends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: Option<String>,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub complaint: Option<String>,
    pub profile_image_url: Option<String>,
}

/// The signed-in user. Passed explicitly into every service that acts on
/// behalf of someone.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub user_type: UserType,
    pub profile: UserProfile,
}

impl Session {
    pub fn new(user_id: impl Into<String>, user_type: UserType, profile: UserProfile) -> Self {
        Self {
            user_id: user_id.into(),
            user_type,
            profile,
        }
    }

    pub fn is_client(&self) -> bool {
        self.user_type == UserType::Client
    }

    pub fn is_therapist(&self) -> bool {
        self.user_type.is_therapist()
    }

    pub fn display_name(&self) -> &str {
        self.profile.name.as_deref().unwrap_or("A client")
    }
}
