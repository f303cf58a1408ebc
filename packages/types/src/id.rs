use serde::{Deserialize, Deserializer, Serialize};
use std::{ops::Deref, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdError {
    #[error("ID must be between 1 and 64 characters")]
    LengthError,
    #[error("ID must be lowercase alphanumeric (plus `-` and `_`)")]
    CharError,
    #[error("repository must be in `owner/name` form")]
    RepositoryForm,
    #[error("invalid UUID: {0}")]
    Uuid(String),
}

/// Macro for generating string-backed ID types with validation
macro_rules! new_string_id_type {
    ($type_name:ident) => {
        /// A string with strict validation rules: `[a-z0-9-_]{1,64}`
        #[derive(Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
        #[serde(transparent)]
        pub struct $type_name(String);

        impl $type_name {
            pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into();

                if id.is_empty() || id.len() > 64 {
                    return Err(IdError::LengthError);
                }
                if !id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_numeric() || c == '_' || c == '-')
                {
                    return Err(IdError::CharError);
                }
                Ok(Self(id))
            }
        }

        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $type_name::new(s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }

        impl TryFrom<&str> for $type_name {
            type Error = IdError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $type_name::new(s)
            }
        }
    };
}

/// Macro for generating UUID-backed ID types
macro_rules! new_uuid_id_type {
    ($type_name:ident) => {
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
        )]
        #[serde(transparent)]
        pub struct $type_name(Uuid);

        impl $type_name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $type_name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $type_name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| IdError::Uuid(e.to_string()))
            }
        }
    };
}

new_string_id_type!(RuleId);
new_string_id_type!(RunnerName);

new_uuid_id_type!(JobId);
new_uuid_id_type!(RunnerId);

/// The container id handed back by the container runtime. Opaque, not validated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ContainerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository in `owner/name` form, as delivered by the upstream.
///
/// `owner` and `name` are each non-empty and may not contain `/`. The
/// normalized form (lowercase, non `[a-z0-9-]` replaced with `-`) is what
/// network names and container labels are derived from.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(transparent)]
pub struct Repository(String);

impl Repository {
    pub fn new(repo: impl Into<String>) -> Result<Self, IdError> {
        let repo = repo.into();

        if repo.is_empty() || repo.len() > 140 {
            return Err(IdError::LengthError);
        }
        let mut parts = repo.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(owner), Some(name)) if !owner.is_empty() && !name.is_empty() => {
                if name.contains('/') {
                    return Err(IdError::RepositoryForm);
                }
            }
            _ => return Err(IdError::RepositoryForm),
        }
        Ok(Self(repo))
    }

    pub fn owner(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }

    /// Lowercase, with every char outside `[a-z0-9-]` replaced by `-`.
    pub fn normalized(&self) -> String {
        self.0
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }
}

impl<'de> Deserialize<'de> for Repository {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Repository::new(s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for Repository {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Repository {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Repository {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Repository::new(s)
    }
}
