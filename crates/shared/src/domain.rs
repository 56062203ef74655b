use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(RemoteId);
id_newtype!(RoomId);
id_newtype!(EventId);
id_newtype!(LocalUserId);
id_newtype!(ContentUri);

/// Identifies one mirrored conversation.
///
/// Group conversations use the group id as both halves. Direct conversations
/// carry the counterpart's remote id as `conversation_id` and the bridged
/// account's remote id as `receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub conversation_id: RemoteId,
    pub receiver: RemoteId,
}

impl ConversationKey {
    pub fn new(conversation_id: RemoteId, receiver: RemoteId) -> Self {
        Self {
            conversation_id,
            receiver,
        }
    }

    pub fn group(group_id: RemoteId) -> Self {
        Self {
            receiver: group_id.clone(),
            conversation_id: group_id,
        }
    }

    pub fn direct(counterpart: RemoteId, receiver: RemoteId) -> Self {
        Self {
            conversation_id: counterpart,
            receiver,
        }
    }

    pub fn is_private(&self) -> bool {
        self.conversation_id != self.receiver
    }

    /// Parses the printed form: `conv` for groups, `conv+receiver` for direct chats.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('+');
        let first = parts.next().filter(|part| is_valid_numeric_id(part))?;
        match (parts.next(), parts.next()) {
            (None, _) => Some(Self::group(RemoteId::from(first))),
            (Some(second), None) if is_valid_numeric_id(second) => Some(Self::direct(
                RemoteId::from(first),
                RemoteId::from(second),
            )),
            _ => None,
        }
    }

    /// Resolves a remote conversation id as seen by `own_remote_id`.
    ///
    /// The remote service names direct chats `a+b` with both participants in
    /// either order; the half that is not ours is the counterpart.
    pub fn from_conversation_id(raw: &str, own_remote_id: &RemoteId) -> Option<Self> {
        match raw.split_once('+') {
            None if is_valid_numeric_id(raw) => Some(Self::group(RemoteId::from(raw))),
            None => None,
            Some((a, b)) => {
                if !is_valid_numeric_id(a) || !is_valid_numeric_id(b) {
                    return None;
                }
                let counterpart = if a == own_remote_id.as_str() {
                    b
                } else if b == own_remote_id.as_str() {
                    a
                } else {
                    return None;
                };
                Some(Self::direct(RemoteId::from(counterpart), own_remote_id.clone()))
            }
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_private() {
            write!(f, "{}+{}", self.conversation_id, self.receiver)
        } else {
            write!(f, "{}", self.conversation_id)
        }
    }
}

fn is_valid_numeric_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.bytes().all(|b| b.is_ascii_digit())
        && raw.bytes().any(|b| b != b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_key_prints_single_id() {
        let key = ConversationKey::group(RemoteId::from("123"));
        assert!(!key.is_private());
        assert_eq!(key.to_string(), "123");
        assert_eq!(ConversationKey::parse("123"), Some(key));
    }

    #[test]
    fn direct_key_round_trips_through_display() {
        let key = ConversationKey::direct(RemoteId::from("55"), RemoteId::from("77"));
        assert!(key.is_private());
        assert_eq!(ConversationKey::parse(&key.to_string()), Some(key));
    }

    #[test]
    fn parse_rejects_zero_and_non_numeric_ids() {
        assert_eq!(ConversationKey::parse("0"), None);
        assert_eq!(ConversationKey::parse("abc"), None);
        assert_eq!(ConversationKey::parse("12+x"), None);
        assert_eq!(ConversationKey::parse(""), None);
        assert_eq!(ConversationKey::parse("1+2+3"), None);
    }

    #[test]
    fn conversation_id_resolves_counterpart_in_either_order() {
        let me = RemoteId::from("10");
        let left = ConversationKey::from_conversation_id("10+20", &me).expect("key");
        let right = ConversationKey::from_conversation_id("20+10", &me).expect("key");
        assert_eq!(left, right);
        assert_eq!(left.conversation_id, RemoteId::from("20"));
        assert_eq!(left.receiver, me);
        assert_eq!(ConversationKey::from_conversation_id("30+40", &me), None);
    }
}
