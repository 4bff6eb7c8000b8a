//! Line-level parsing of the application log.
//!
//! ```text
//! 2024.05.01 21:14:03 Log        -  [Behaviour] Joining wrld_4cf5...:81234~friends(usr_x)~region(jp)
//! 2024.05.01 21:14:05 Log        -  [Behaviour] Entering Room: The Black Cat
//! 2024.05.01 22:40:11 Log        -  [Behaviour] Leaving wrld_4cf5...
//! 2024.05.01 20:58:00 Log        -  User Authenticated: Kiri (usr_0b1c-77)
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::models::{InstanceType, LogContext, LogUser};

const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";
const JOIN_MARKER: &str = "Joining wrld_";
const LEAVE_MARKER: &str = "Leaving wrld_";

/// Zone the log producer writes its timestamps in.
#[derive(Debug, Clone, Copy)]
pub enum LogTimezone {
    Local,
    Fixed(FixedOffset),
}

impl LogTimezone {
    fn to_utc(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            LogTimezone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            LogTimezone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Join(LogContext),
    /// The player left the current instance at `at`.
    Leave {
        at: DateTime<Utc>,
    },
    RoomName(String),
    UserAuthenticated(LogUser),
    /// Looked like a join or leave line but could not be decoded.
    Malformed,
    Irrelevant,
}

pub struct LogLineParser {
    timestamp: Regex,
    join: Regex,
    room: Regex,
    user: Regex,
    timezone: LogTimezone,
}

impl LogLineParser {
    pub fn new(timezone: LogTimezone) -> Result<Self> {
        Ok(Self {
            timestamp: Regex::new(r"^(\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2})")
                .context("invalid timestamp pattern")?,
            join: Regex::new(r"Joining (wrld_[0-9A-Za-z_-]+):(\S+)")
                .context("invalid join pattern")?,
            room: Regex::new(r"(?:Entering Room|Joining or Creating Room): (.+?)\s*$")
                .context("invalid room pattern")?,
            user: Regex::new(r"User Authenticated: (.*?) \((usr_[a-zA-Z0-9\-]+)\)")
                .context("invalid user pattern")?,
            timezone,
        })
    }

    pub fn parse(&self, line: &str) -> ParsedLine {
        if line.contains(JOIN_MARKER) {
            return self
                .parse_join(line)
                .map(ParsedLine::Join)
                .unwrap_or(ParsedLine::Malformed);
        }
        if line.contains(LEAVE_MARKER) {
            return self
                .timestamp_of(line)
                .map(|at| ParsedLine::Leave { at })
                .unwrap_or(ParsedLine::Malformed);
        }
        if let Some(caps) = self.user.captures(line) {
            return ParsedLine::UserAuthenticated(LogUser {
                display_name: caps[1].to_string(),
                user_id: caps[2].to_string(),
            });
        }

        match self.room.captures(line) {
            Some(caps) => ParsedLine::RoomName(caps[1].to_string()),
            None => ParsedLine::Irrelevant,
        }
    }

    fn timestamp_of(&self, line: &str) -> Option<DateTime<Utc>> {
        let stamp = self.timestamp.captures(line)?;
        let naive = NaiveDateTime::parse_from_str(&stamp[1], TIMESTAMP_FORMAT).ok()?;
        self.timezone.to_utc(naive)
    }

    fn parse_join(&self, line: &str) -> Option<LogContext> {
        let joined_at = self.timestamp_of(line)?;

        let caps = self.join.captures(line)?;
        let instance_id = caps[2].to_string();

        Some(LogContext {
            world_id: caps[1].to_string(),
            instance_type: InstanceType::from_instance_tags(&instance_id),
            instance_id,
            joined_at,
            world_name: None,
        })
    }
}
