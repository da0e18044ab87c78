use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use url::Url;

use crate::cache::{AnalysisRecord, Flag};

pub const DEFAULT_DB_PATH: &str = "data/terms.sqlite";

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS websites (
            website_id INTEGER PRIMARY KEY,
            url        TEXT UNIQUE NOT NULL,
            domain     TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS terms_snapshots (
            snapshot_id INTEGER PRIMARY KEY,
            website_id  INTEGER NOT NULL REFERENCES websites(website_id),
            terms_data  TEXT NOT NULL,
            terms_hash  TEXT NOT NULL,
            captured_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(website_id, terms_hash)
        );

        CREATE TABLE IF NOT EXISTS analyses (
            analysis_id   INTEGER PRIMARY KEY,
            snapshot_id   INTEGER NOT NULL REFERENCES terms_snapshots(snapshot_id),
            overall_score INTEGER NOT NULL CHECK(overall_score BETWEEN 0 AND 100),
            summary       TEXT NOT NULL,
            analyzed_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_analyses_snapshot ON analyses(snapshot_id);

        CREATE TABLE IF NOT EXISTS analysis_items (
            item_id     INTEGER PRIMARY KEY,
            analysis_id INTEGER NOT NULL REFERENCES analyses(analysis_id),
            title       TEXT NOT NULL,
            description TEXT NOT NULL,
            flag        TEXT NOT NULL CHECK(flag IN ('good','info','warning','critical')),
            category    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_items_analysis ON analysis_items(analysis_id);

        CREATE TABLE IF NOT EXISTS user_saved_websites (
            user_id     TEXT NOT NULL,
            snapshot_id INTEGER NOT NULL REFERENCES terms_snapshots(snapshot_id),
            saved_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
            is_active   BOOLEAN NOT NULL DEFAULT 1,
            PRIMARY KEY (user_id, snapshot_id)
        );
        ",
    )?;
    Ok(())
}

// ── Settings ──

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(value)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn all_settings(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Recording analyses ──

/// 64-bit FNV-1a of `text`, as 16 hex digits.
pub fn terms_hash(text: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{:016x}", hash)
}

pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// "www.example.co.uk" -> "Example"
pub fn display_name(domain: &str) -> String {
    let bare = domain.strip_prefix("www.").unwrap_or(domain);
    let label = bare.split('.').next().unwrap_or(bare);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Store a completed analysis of `text` fetched from `url`. Returns the
/// snapshot id. Identical text for the same website reuses its snapshot.
pub fn record_analysis(
    conn: &Connection,
    url: &str,
    text: &str,
    record: &AnalysisRecord,
) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO websites (url, domain) VALUES (?1, ?2) ON CONFLICT(url) DO NOTHING",
        params![url, domain_of(url)],
    )?;
    let website_id: i64 = tx.query_row(
        "SELECT website_id FROM websites WHERE url = ?1",
        [url],
        |r| r.get(0),
    )?;

    let hash = terms_hash(text);
    tx.execute(
        "INSERT INTO terms_snapshots (website_id, terms_data, terms_hash) VALUES (?1, ?2, ?3)
         ON CONFLICT(website_id, terms_hash) DO NOTHING",
        params![website_id, text, hash],
    )?;
    let snapshot_id: i64 = tx.query_row(
        "SELECT snapshot_id FROM terms_snapshots WHERE website_id = ?1 AND terms_hash = ?2",
        params![website_id, hash],
        |r| r.get(0),
    )?;

    tx.execute(
        "INSERT INTO analyses (snapshot_id, overall_score, summary) VALUES (?1, ?2, ?3)",
        params![snapshot_id, record.score, record.summary],
    )?;
    let analysis_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO analysis_items (analysis_id, title, description, flag, category)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for item in &record.items {
            stmt.execute(params![
                analysis_id,
                item.title,
                item.description,
                item.flag.as_str(),
                item.category,
            ])?;
        }
    }
    tx.commit()?;
    Ok(snapshot_id)
}

// ── Dashboard read model ──

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub flag: Flag,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebsiteDetails {
    pub snapshot_id: i64,
    pub website_id: i64,
    pub website_name: String,
    pub website_url: String,
    pub domain: String,
    pub score: u8,
    pub date: String,
    pub summary: String,
    pub alerts: Vec<Alert>,
}

// Latest analysis of each snapshot.
const DETAILS_COLUMNS: &str = "
    SELECT s.snapshot_id, w.website_id, w.url, w.domain,
           a.analysis_id, a.overall_score, a.summary, substr(s.captured_at, 1, 10)";

const DETAILS_FROM: &str = "
    FROM terms_snapshots s
    JOIN websites w ON w.website_id = s.website_id
    JOIN analyses a ON a.analysis_id = (
        SELECT MAX(analysis_id) FROM analyses WHERE snapshot_id = s.snapshot_id
    )";

struct DetailsRow {
    snapshot_id: i64,
    website_id: i64,
    url: String,
    domain: String,
    analysis_id: i64,
    score: u8,
    summary: String,
    date: String,
}

fn details_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetailsRow> {
    Ok(DetailsRow {
        snapshot_id: row.get(0)?,
        website_id: row.get(1)?,
        url: row.get(2)?,
        domain: row.get(3)?,
        analysis_id: row.get(4)?,
        score: row.get(5)?,
        summary: row.get(6)?,
        date: row.get(7)?,
    })
}

fn alerts_for(conn: &Connection, analysis_id: i64) -> Result<Vec<Alert>> {
    let mut stmt = conn.prepare(
        "SELECT flag, title, description FROM analysis_items
         WHERE analysis_id = ?1 ORDER BY item_id",
    )?;
    let rows = stmt
        .query_map([analysis_id], |row| {
            let flag: String = row.get(0)?;
            Ok(Alert {
                flag: Flag::parse(&flag),
                title: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn into_details(conn: &Connection, row: DetailsRow, date: Option<String>) -> Result<WebsiteDetails> {
    Ok(WebsiteDetails {
        snapshot_id: row.snapshot_id,
        website_id: row.website_id,
        website_name: display_name(&row.domain),
        website_url: row.url,
        alerts: alerts_for(conn, row.analysis_id)?,
        domain: row.domain,
        score: row.score,
        date: date.unwrap_or(row.date),
        summary: row.summary,
    })
}

/// Active saves for `user_id`, newest first. Dates are the save dates.
pub fn saved_websites_for_user(conn: &Connection, user_id: &str) -> Result<Vec<WebsiteDetails>> {
    let sql = format!(
        "{}, substr(u.saved_at, 1, 10) {}
         JOIN user_saved_websites u ON u.snapshot_id = s.snapshot_id
         WHERE u.user_id = ?1 AND u.is_active = 1
         ORDER BY u.saved_at DESC, u.rowid DESC",
        DETAILS_COLUMNS, DETAILS_FROM
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id], |row| Ok((details_row(row)?, row.get::<_, String>(8)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(row, saved)| into_details(conn, row, Some(saved)))
        .collect()
}

pub fn website_by_snapshot(conn: &Connection, snapshot_id: i64) -> Result<Option<WebsiteDetails>> {
    let sql = format!("{} {} WHERE s.snapshot_id = ?1", DETAILS_COLUMNS, DETAILS_FROM);
    let row = conn
        .query_row(&sql, [snapshot_id], details_row)
        .optional()?;
    row.map(|r| into_details(conn, r, None)).transpose()
}

pub fn terms_data(conn: &Connection, snapshot_id: i64) -> Result<Option<String>> {
    let data = conn
        .query_row(
            "SELECT terms_data FROM terms_snapshots WHERE snapshot_id = ?1",
            [snapshot_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(data.filter(|d: &String| !d.is_empty()))
}

/// Save (or re-activate) a snapshot for a user.
pub fn save_website_for_user(conn: &Connection, user_id: &str, snapshot_id: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO user_saved_websites (user_id, snapshot_id, is_active) VALUES (?1, ?2, 1)
         ON CONFLICT(user_id, snapshot_id) DO UPDATE
         SET is_active = 1, saved_at = strftime('%Y-%m-%d %H:%M:%f', 'now')",
        params![user_id, snapshot_id],
    )
    .with_context(|| format!("saving snapshot {} for {}", snapshot_id, user_id))?;
    Ok(())
}

/// Soft delete. Returns whether an active save was found.
pub fn remove_website_for_user(conn: &Connection, user_id: &str, snapshot_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE user_saved_websites SET is_active = 0
         WHERE user_id = ?1 AND snapshot_id = ?2 AND is_active = 1",
        params![user_id, snapshot_id],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnalysisItem;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn record(score: u8) -> AnalysisRecord {
        AnalysisRecord {
            url: String::new(),
            score,
            summary: "Collects usage data.".into(),
            items: vec![
                AnalysisItem {
                    title: "Data sharing".into(),
                    description: "Shared with partners".into(),
                    flag: Flag::Warning,
                    category: Some("privacy".into()),
                },
                AnalysisItem {
                    title: "Deletion".into(),
                    description: "You can delete your account".into(),
                    flag: Flag::Good,
                    category: None,
                },
            ],
            cached: false,
            snapshot_id: None,
        }
    }

    #[test]
    fn fnv_hash_is_stable() {
        assert_eq!(terms_hash(""), "cbf29ce484222325");
        assert_eq!(terms_hash("a"), "af63dc4c8601ec8c");
        assert_ne!(terms_hash("We collect data."), terms_hash("We collect data"));
    }

    #[test]
    fn display_name_from_domain() {
        assert_eq!(display_name("www.example.com"), "Example");
        assert_eq!(display_name("github.com"), "Github");
        assert_eq!(display_name("shop.example.co.uk"), "Shop");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn settings_round_trip() {
        let conn = memory();
        assert_eq!(get_setting(&conn, "userId").unwrap(), None);
        set_setting(&conn, "userId", "u-1").unwrap();
        set_setting(&conn, "userId", "u-2").unwrap();
        assert_eq!(get_setting(&conn, "userId").unwrap().as_deref(), Some("u-2"));
        assert_eq!(all_settings(&conn).unwrap().len(), 1);
    }

    #[test]
    fn recorded_analysis_is_readable_by_snapshot() {
        let conn = memory();
        let url = "https://www.example.com/privacy";
        let id = record_analysis(&conn, url, "We collect data.", &record(72)).unwrap();

        let details = website_by_snapshot(&conn, id).unwrap().unwrap();
        assert_eq!(details.website_name, "Example");
        assert_eq!(details.domain, "www.example.com");
        assert_eq!(details.score, 72);
        assert_eq!(details.alerts.len(), 2);
        assert_eq!(details.alerts[0].flag, Flag::Warning);
        assert_eq!(details.date.len(), 10);
        assert_eq!(terms_data(&conn, id).unwrap().as_deref(), Some("We collect data."));
        assert!(website_by_snapshot(&conn, id + 100).unwrap().is_none());
    }

    #[test]
    fn same_text_reuses_snapshot_and_latest_analysis_wins() {
        let conn = memory();
        let url = "https://example.com/terms";
        let first = record_analysis(&conn, url, "Terms text", &record(40)).unwrap();
        let second = record_analysis(&conn, url, "Terms text", &record(90)).unwrap();
        assert_eq!(first, second);
        assert_eq!(website_by_snapshot(&conn, first).unwrap().unwrap().score, 90);

        let third = record_analysis(&conn, url, "Revised terms", &record(50)).unwrap();
        assert_ne!(third, first);
    }

    #[test]
    fn saved_websites_are_active_only() {
        let conn = memory();
        let a = record_analysis(&conn, "https://alpha.com/terms", "a", &record(80)).unwrap();
        let b = record_analysis(&conn, "https://beta.io/terms", "b", &record(30)).unwrap();

        save_website_for_user(&conn, "u1", a).unwrap();
        save_website_for_user(&conn, "u1", b).unwrap();
        let saved = saved_websites_for_user(&conn, "u1").unwrap();
        let names: Vec<&str> = saved.iter().map(|w| w.website_name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "Alpha"]);

        assert!(remove_website_for_user(&conn, "u1", b).unwrap());
        assert!(!remove_website_for_user(&conn, "u1", b).unwrap());
        let saved = saved_websites_for_user(&conn, "u1").unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].snapshot_id, a);
        assert!(saved_websites_for_user(&conn, "someone-else").unwrap().is_empty());

        save_website_for_user(&conn, "u1", b).unwrap();
        assert_eq!(saved_websites_for_user(&conn, "u1").unwrap().len(), 2);
    }
}
