//! World/instance context derived from the application log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Private,
    Friends,
    FriendsPlus,
    Public,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Private => "private",
            InstanceType::Friends => "friends",
            InstanceType::FriendsPlus => "friends_plus",
            InstanceType::Public => "public",
        }
    }

    /// Derives the access type from the `~tag(...)` suffixes of an instance
    /// location such as `12345~friends(usr_x)~region(jp)`. Instances without an
    /// access tag are public.
    pub fn from_instance_tags(instance: &str) -> Self {
        let has_tag = |tag: &str| {
            instance
                .split('~')
                .skip(1)
                .any(|segment| segment.starts_with(tag) && segment[tag.len()..].starts_with('('))
        };

        if has_tag("private") {
            InstanceType::Private
        } else if has_tag("hidden") {
            InstanceType::FriendsPlus
        } else if has_tag("friends") {
            InstanceType::Friends
        } else {
            InstanceType::Public
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogContext {
    pub world_id: String,
    pub instance_id: String,
    pub instance_type: InstanceType,
    /// Timestamp embedded in the join line.
    pub joined_at: DateTime<Utc>,
    /// Display name from a later `Entering Room` line, if one was seen.
    pub world_name: Option<String>,
}

impl LogContext {
    pub fn same_join(&self, other: &LogContext) -> bool {
        self.world_id == other.world_id
            && self.instance_id == other.instance_id
            && self.joined_at == other.joined_at
    }
}

/// Account the game client signed in as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogUser {
    pub display_name: String,
    pub user_id: String,
}

/// Where the player is right now, as far as the log has told us.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presence {
    pub user: Option<LogUser>,
    pub location: Option<LogContext>,
}
