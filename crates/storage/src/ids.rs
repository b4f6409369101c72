use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{
    EmptyIdSnafu, InvalidIdSnafu, MarkedDurableIdSnafu, StorageError, StorageResult,
};

/// Textual marker that separates client-minted ids from remote-minted ones.
pub const PROVISIONAL_ID_MARKER: &str = "local:";

/// Client-generated identity for an entity the remote authority has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str, id_type: &'static str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-local-id",
            id_type,
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

// Macro keeps chat and message ids structurally identical, so reconciliation code can
// treat both the same way.
macro_rules! define_tagged_id {
    ($name:ident, $durable:ident, $id_type:literal) => {
        /// Identifier minted by the remote authority.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $durable(String);

        impl $durable {
            pub fn new(raw: impl Into<String>) -> StorageResult<Self> {
                let raw = raw.into();
                ensure!(
                    !raw.trim().is_empty(),
                    EmptyIdSnafu {
                        stage: "durable-id-new",
                        id_type: $id_type,
                    }
                );
                // Text form must parse back to the same variant.
                ensure!(
                    !raw.starts_with(PROVISIONAL_ID_MARKER),
                    MarkedDurableIdSnafu {
                        stage: "durable-id-new",
                        id_type: $id_type,
                        raw: raw.clone(),
                    }
                );
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $durable {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            Provisional(LocalId),
            Durable($durable),
        }

        impl $name {
            pub fn provisional() -> Self {
                Self::Provisional(LocalId::new_v7())
            }

            pub fn durable(raw: impl Into<String>) -> StorageResult<Self> {
                $durable::new(raw).map(Self::Durable)
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                match raw.strip_prefix(PROVISIONAL_ID_MARKER) {
                    Some(local) => LocalId::parse(local, $id_type).map(Self::Provisional),
                    None => Self::durable(raw),
                }
            }

            pub fn is_provisional(&self) -> bool {
                matches!(self, Self::Provisional(_))
            }

            pub fn as_durable(&self) -> Option<&$durable> {
                match self {
                    Self::Durable(durable) => Some(durable),
                    Self::Provisional(_) => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    Self::Provisional(local) => write!(formatter, "{PROVISIONAL_ID_MARKER}{local}"),
                    Self::Durable(durable) => write!(formatter, "{durable}"),
                }
            }
        }

        impl From<$durable> for $name {
            fn from(value: $durable) -> Self {
                Self::Durable(value)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }

        impl Serialize for $durable {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $durable {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_tagged_id!(ChatId, DurableChatId, "chat-id");
define_tagged_id!(MessageId, DurableMessageId, "message-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_ids_round_trip_through_their_text_form() {
        let chat_id = ChatId::provisional();
        let text = chat_id.to_string();

        assert!(text.starts_with(PROVISIONAL_ID_MARKER));
        assert_eq!(ChatId::parse(&text).unwrap(), chat_id);
    }

    #[test]
    fn unmarked_text_parses_as_durable() {
        let message_id = MessageId::parse("k57a9x2").unwrap();

        assert!(!message_id.is_provisional());
        assert_eq!(message_id.as_durable().unwrap().as_str(), "k57a9x2");
    }

    #[test]
    fn malformed_provisional_and_blank_durable_ids_are_rejected() {
        assert!(matches!(
            ChatId::parse("local:not-a-uuid"),
            Err(StorageError::InvalidId { .. })
        ));
        assert!(matches!(
            MessageId::parse("  "),
            Err(StorageError::EmptyId { .. })
        ));
    }

    #[test]
    fn durable_ids_cannot_carry_the_provisional_marker() {
        let raw = format!("{PROVISIONAL_ID_MARKER}{}", LocalId::new_v7());

        assert!(matches!(
            DurableMessageId::new(raw.clone()),
            Err(StorageError::MarkedDurableId { .. })
        ));
        assert!(matches!(
            ChatId::durable("local:chat-7"),
            Err(StorageError::MarkedDurableId { .. })
        ));
        assert!(ChatId::parse(&raw).unwrap().is_provisional());
    }
}
