//! Guild member roster export for `/members_export`.

use crate::error::StorageError;
use crate::storage::ObjectStore;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How long the download link of an export stays valid.
pub const EXPORT_LINK_TTL: Duration = Duration::from_secs(60 * 60);

const HEADER: [&str; 5] = ["Displayed Name", "Nickname", "Username", "Day Joined", "Roles"];

/// One guild member as exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub display_name: String,
    pub nickname: Option<String>,
    pub username: String,
    pub joined_at: Option<DateTime<Utc>>,
    /// Role names, the `@everyone` role excluded.
    pub roles: Vec<String>,
}

/// Drop every non-ASCII character. Role names are often decorated with emoji.
pub fn strip_non_ascii(text: &str) -> String {
    text.chars().filter(char::is_ascii).collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut row = fields.into_iter().map(csv_field).collect::<Vec<_>>().join(",");
    row.push_str("\r\n");
    row
}

/// Render the roster as CSV with a header row.
pub fn roster_csv(members: &[MemberRecord]) -> String {
    let mut csv = csv_row(HEADER);
    for member in members {
        let joined = member
            .joined_at
            .map(|joined| joined.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let roles = member
            .roles
            .iter()
            .map(|role| strip_non_ascii(role))
            .collect::<Vec<_>>()
            .join(", ");
        csv.push_str(&csv_row([
            member.display_name.as_str(),
            member.nickname.as_deref().unwrap_or(""),
            member.username.as_str(),
            joined.as_str(),
            roles.as_str(),
        ]));
    }
    csv
}

pub fn export_key(upload_prefix: &str, guild_id: u64, now: DateTime<Utc>) -> String {
    format!("{upload_prefix}member_list_{guild_id}_{}.csv", now.timestamp())
}

/// Upload the roster privately and return a time-limited download link.
pub async fn export(
    store: &dyn ObjectStore,
    upload_prefix: &str,
    guild_id: u64,
    members: &[MemberRecord],
    now: DateTime<Utc>,
) -> Result<String, StorageError> {
    let key = export_key(upload_prefix, guild_id, now);
    let body = roster_csv(members).into_bytes();
    tracing::info!(%key, members = members.len(), "exporting member roster");
    store
        .put_private_presigned(&key, body, "text/csv", EXPORT_LINK_TTL)
        .await
}
