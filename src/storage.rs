//! SQLite-backed document store
//!
//! Collections: `rules`, `connections`, `connection_streams`, `pcap_sessions`,
//! `services`, `settings`. Nested documents (block arrays, pattern matches,
//! account maps) are JSON columns; payloads are BLOBs. Row ids come from a
//! single monotonic allocator shared by every collection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};

use crate::error::{CaronteError, Result};
use crate::models::{
    Connection, ConnectionStream, PatternSlice, PcapSession, RowId, Service, SessionSource,
    Settings,
};
use crate::rules::Rule;

/// Thread-safe store handle
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<SqliteConnection>>,
}

/// Filters accepted by `list_connections`
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    pub service_port: Option<u16>,
    /// Every listed rule must appear in the connection's matched rules
    pub matched_rules: Vec<RowId>,
    pub client_address: Option<String>,
    pub client_port: Option<u16>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,
    pub marked: Option<bool>,
    pub hidden: Option<bool>,
    /// Rows strictly after this id, ascending
    pub from: Option<RowId>,
    /// Rows strictly before this id, descending
    pub to: Option<RowId>,
    pub limit: usize,
}

impl Storage {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = SqliteConnection::open(&path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Monotonic row-id allocator shared by all collections
            CREATE TABLE IF NOT EXISTS row_ids (
                counter INTEGER NOT NULL
            );
            INSERT INTO row_ids (counter)
                SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM row_ids);

            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                color TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                patterns TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                ip_src TEXT NOT NULL,
                port_src INTEGER NOT NULL,
                ip_dst TEXT NOT NULL,
                port_dst INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                closed_at INTEGER NOT NULL,
                client_bytes INTEGER NOT NULL,
                server_bytes INTEGER NOT NULL,
                client_documents INTEGER NOT NULL,
                server_documents INTEGER NOT NULL,
                processed_at INTEGER NOT NULL,
                matched_rules TEXT NOT NULL DEFAULT '[]',
                service_port INTEGER NOT NULL,
                marked INTEGER NOT NULL DEFAULT 0,
                hidden INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_connections_service
                ON connections(service_port);
            CREATE INDEX IF NOT EXISTS idx_connections_started
                ON connections(started_at);

            CREATE TABLE IF NOT EXISTS connection_streams (
                id INTEGER PRIMARY KEY,
                connection_id INTEGER NOT NULL,
                from_client INTEGER NOT NULL,
                document_index INTEGER NOT NULL,
                payload BLOB NOT NULL,
                blocks_indexes TEXT NOT NULL,
                blocks_timestamps TEXT NOT NULL,
                blocks_loss TEXT NOT NULL,
                pattern_matches TEXT NOT NULL DEFAULT '{}',
                scanned_version INTEGER NOT NULL DEFAULT 0,
                UNIQUE(connection_id, from_client, document_index)
            );

            CREATE TABLE IF NOT EXISTS pcap_sessions (
                id INTEGER PRIMARY KEY,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                size INTEGER NOT NULL DEFAULT 0,
                processed_packets INTEGER NOT NULL DEFAULT 0,
                invalid_packets INTEGER NOT NULL DEFAULT 0,
                packets_per_service TEXT NOT NULL DEFAULT '{}',
                source TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS services (
                port INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                server_address TEXT NOT NULL,
                flag_regex TEXT NOT NULL,
                auth_required INTEGER NOT NULL DEFAULT 0,
                accounts TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )?;

        Ok(())
    }

    /// Allocate the next row id. Strictly increasing across restarts.
    pub fn next_row_id(&self) -> Result<RowId> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE row_ids SET counter = counter + 1", [])?;
        let id: i64 = conn.query_row("SELECT counter FROM row_ids", [], |row| row.get(0))?;
        Ok(RowId(id))
    }

    // ==================== Rules ====================

    pub fn insert_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let patterns = to_json(&rule.patterns)?;
        conn.execute(
            "INSERT INTO rules (id, name, color, notes, enabled, patterns, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                rule.id.0,
                rule.name,
                rule.color,
                rule.notes,
                rule.enabled,
                patterns,
                rule.version as i64,
            ],
        )?;
        Ok(())
    }

    pub fn update_rule(&self, rule: &Rule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let patterns = to_json(&rule.patterns)?;
        let changed = conn.execute(
            "UPDATE rules SET name = ?, color = ?, notes = ?, enabled = ?, patterns = ?, version = ?
             WHERE id = ?",
            params![
                rule.name,
                rule.color,
                rule.notes,
                rule.enabled,
                patterns,
                rule.version as i64,
                rule.id.0,
            ],
        )?;
        if changed == 0 {
            return Err(CaronteError::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, color, notes, enabled, patterns, version FROM rules ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut rules = Vec::new();
        for row in rows {
            let (id, name, color, notes, enabled, patterns, version) = row?;
            rules.push(Rule {
                id: RowId(id),
                name,
                color,
                notes,
                enabled,
                patterns: from_json(&patterns)?,
                version: version as u64,
            });
        }
        Ok(rules)
    }

    // ==================== Connections ====================

    /// Insert a connection unless one with the same id already exists.
    /// Returns false on the replay of an already finalized flow.
    pub fn insert_connection_if_absent(&self, connection: &Connection) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let matched = to_json(&connection.matched_rules)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO connections
             (id, ip_src, port_src, ip_dst, port_dst, started_at, closed_at,
              client_bytes, server_bytes, client_documents, server_documents,
              processed_at, matched_rules, service_port, marked, hidden)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                connection.id.0,
                connection.ip_src.to_string(),
                connection.port_src,
                connection.ip_dst.to_string(),
                connection.port_dst,
                connection.started_at.timestamp_millis(),
                connection.closed_at.timestamp_millis(),
                connection.client_bytes as i64,
                connection.server_bytes as i64,
                connection.client_documents as i64,
                connection.server_documents as i64,
                connection.processed_at.timestamp_millis(),
                matched,
                connection.service_port,
                connection.marked,
                connection.hidden,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_connection(&self, id: RowId) -> Result<Option<Connection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?", CONNECTION_SELECT))?;
        let result = stmt
            .query_row(params![id.0], connection_from_row)
            .optional()?;
        result.transpose()
    }

    pub fn list_connections(&self, filter: &ConnectionFilter) -> Result<Vec<Connection>> {
        let mut sql = String::from(CONNECTION_SELECT);
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(port) = filter.service_port {
            clauses.push("service_port = ?".into());
            args.push(Box::new(port));
        }
        if let Some(addr) = &filter.client_address {
            clauses.push("ip_src = ?".into());
            args.push(Box::new(addr.clone()));
        }
        if let Some(port) = filter.client_port {
            clauses.push("port_src = ?".into());
            args.push(Box::new(port));
        }
        if let Some(min) = filter.min_duration_ms {
            clauses.push("(closed_at - started_at) >= ?".into());
            args.push(Box::new(min));
        }
        if let Some(max) = filter.max_duration_ms {
            clauses.push("(closed_at - started_at) <= ?".into());
            args.push(Box::new(max));
        }
        if let Some(min) = filter.min_bytes {
            clauses.push("(client_bytes + server_bytes) >= ?".into());
            args.push(Box::new(min as i64));
        }
        if let Some(max) = filter.max_bytes {
            clauses.push("(client_bytes + server_bytes) <= ?".into());
            args.push(Box::new(max as i64));
        }
        if let Some(after) = filter.started_after {
            clauses.push("started_at > ?".into());
            args.push(Box::new(after.timestamp_millis()));
        }
        if let Some(before) = filter.started_before {
            clauses.push("started_at < ?".into());
            args.push(Box::new(before.timestamp_millis()));
        }
        if let Some(after) = filter.closed_after {
            clauses.push("closed_at > ?".into());
            args.push(Box::new(after.timestamp_millis()));
        }
        if let Some(before) = filter.closed_before {
            clauses.push("closed_at < ?".into());
            args.push(Box::new(before.timestamp_millis()));
        }
        if let Some(marked) = filter.marked {
            clauses.push("marked = ?".into());
            args.push(Box::new(marked));
        }
        if let Some(hidden) = filter.hidden {
            clauses.push("hidden = ?".into());
            args.push(Box::new(hidden));
        }

        // from/to pagination drives the sort direction
        let descending = match (filter.from, filter.to) {
            (Some(from), _) => {
                clauses.push("id > ?".into());
                args.push(Box::new(from.0));
                false
            }
            (None, Some(to)) => {
                clauses.push("id < ?".into());
                args.push(Box::new(to.0));
                true
            }
            (None, None) => true,
        };

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(if descending {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        });

        let limit = if filter.limit == 0 { 50 } else { filter.limit };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), connection_from_row)?;

        // matched_rules is a JSON column; the containment filter is applied
        // here after the scalar filters, stopping once the page is full.
        let mut connections = Vec::new();
        for row in rows {
            let connection = row??;
            if !filter.matched_rules.is_empty()
                && !filter
                    .matched_rules
                    .iter()
                    .all(|r| connection.matched_rules.contains(r))
            {
                continue;
            }
            connections.push(connection);
            if connections.len() >= limit {
                break;
            }
        }
        Ok(connections)
    }

    pub fn set_connection_marked(&self, id: RowId, marked: bool) -> Result<()> {
        self.set_connection_flag(id, "marked", marked)
    }

    pub fn set_connection_hidden(&self, id: RowId, hidden: bool) -> Result<()> {
        self.set_connection_flag(id, "hidden", hidden)
    }

    fn set_connection_flag(&self, id: RowId, column: &str, value: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!("UPDATE connections SET {} = ? WHERE id = ?", column),
            params![value, id.0],
        )?;
        if changed == 0 {
            return Err(CaronteError::NotFound(format!("connection {}", id)));
        }
        Ok(())
    }

    pub fn update_connection_matched_rules(&self, id: RowId, rules: &[RowId]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let matched = to_json(&rules)?;
        conn.execute(
            "UPDATE connections SET matched_rules = ? WHERE id = ?",
            params![matched, id.0],
        )?;
        Ok(())
    }

    /// Ids of all finalized connections, ascending. Used by the re-scan queue.
    pub fn list_connection_ids(&self) -> Result<Vec<RowId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM connections ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(RowId(row?));
        }
        Ok(ids)
    }

    // ==================== Connection streams ====================

    pub fn insert_stream_chunk(&self, chunk: &ConnectionStream) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO connection_streams
             (id, connection_id, from_client, document_index, payload,
              blocks_indexes, blocks_timestamps, blocks_loss, pattern_matches, scanned_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                chunk.id.0,
                chunk.connection_id.0,
                chunk.from_client,
                chunk.document_index as i64,
                chunk.payload,
                to_json(&chunk.blocks_indexes)?,
                to_json(&chunk.blocks_timestamps)?,
                to_json(&chunk.blocks_loss)?,
                to_json(&chunk.pattern_matches)?,
                chunk.scanned_version as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_stream_chunk(
        &self,
        connection_id: RowId,
        from_client: bool,
        document_index: usize,
    ) -> Result<Option<ConnectionStream>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, connection_id, from_client, document_index, payload,
                    blocks_indexes, blocks_timestamps, blocks_loss, pattern_matches, scanned_version
             FROM connection_streams
             WHERE connection_id = ? AND from_client = ? AND document_index = ?",
        )?;
        let result = stmt
            .query_row(
                params![connection_id.0, from_client, document_index as i64],
                stream_from_row,
            )
            .optional()?;
        result.transpose()
    }

    /// All chunks of one side, ordered by document index.
    pub fn stream_chunks(&self, connection_id: RowId, from_client: bool) -> Result<Vec<ConnectionStream>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, connection_id, from_client, document_index, payload,
                    blocks_indexes, blocks_timestamps, blocks_loss, pattern_matches, scanned_version
             FROM connection_streams
             WHERE connection_id = ? AND from_client = ?
             ORDER BY document_index",
        )?;
        let rows = stmt.query_map(params![connection_id.0, from_client], stream_from_row)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row??);
        }
        Ok(chunks)
    }

    /// Rewrite the matches of a chunk after a re-scan against a newer database.
    pub fn update_stream_matches(
        &self,
        id: RowId,
        matches: &HashMap<u64, Vec<PatternSlice>>,
        scanned_version: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE connection_streams SET pattern_matches = ?, scanned_version = ? WHERE id = ?",
            params![to_json(matches)?, scanned_version as i64, id.0],
        )?;
        Ok(())
    }

    // ==================== Pcap sessions ====================

    pub fn insert_session(&self, session: &PcapSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO pcap_sessions
             (id, started_at, completed_at, size, processed_packets, invalid_packets,
              packets_per_service, source)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                session.id.0,
                session.started_at.timestamp_millis(),
                session.completed_at.map(|t| t.timestamp_millis()),
                session.size as i64,
                session.processed_packets as i64,
                session.invalid_packets as i64,
                to_json(&session.packets_per_service)?,
                session.source.to_string(),
            ],
        )?;
        if inserted == 0 {
            return Err(CaronteError::Conflict(format!("session {}", session.id)));
        }
        Ok(())
    }

    pub fn update_session(&self, session: &PcapSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pcap_sessions
             SET completed_at = ?, size = ?, processed_packets = ?, invalid_packets = ?,
                 packets_per_service = ?
             WHERE id = ?",
            params![
                session.completed_at.map(|t| t.timestamp_millis()),
                session.size as i64,
                session.processed_packets as i64,
                session.invalid_packets as i64,
                to_json(&session.packets_per_service)?,
                session.id.0,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: RowId) -> Result<Option<PcapSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?", SESSION_SELECT))?;
        let result = stmt.query_row(params![id.0], session_from_row).optional()?;
        result.transpose()
    }

    pub fn list_sessions(&self) -> Result<Vec<PcapSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id", SESSION_SELECT))?;
        let rows = stmt.query_map([], session_from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    // ==================== Services ====================

    pub fn upsert_service(&self, service: &Service) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO services (port, name, color, notes) VALUES (?, ?, ?, ?)
             ON CONFLICT(port) DO UPDATE SET name = excluded.name,
                 color = excluded.color, notes = excluded.notes",
            params![service.port, service.name, service.color, service.notes],
        )?;
        Ok(())
    }

    pub fn list_services(&self) -> Result<Vec<Service>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT port, name, color, notes FROM services ORDER BY port")?;
        let rows = stmt.query_map([], |row| {
            Ok(Service {
                port: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                notes: row.get(3)?,
            })
        })?;
        let mut services = Vec::new();
        for row in rows {
            services.push(row?);
        }
        Ok(services)
    }

    // ==================== Settings ====================

    pub fn get_settings(&self) -> Result<Option<Settings>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT server_address, flag_regex, auth_required, accounts FROM settings WHERE id = 1",
        )?;
        let row = stmt
            .query_row([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        match row {
            Some((server_address, flag_regex, auth_required, accounts)) => Ok(Some(Settings {
                server_address,
                flag_regex,
                auth_required,
                accounts: from_json(&accounts)?,
            })),
            None => Ok(None),
        }
    }

    pub fn put_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (id, server_address, flag_regex, auth_required, accounts)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET server_address = excluded.server_address,
                 flag_regex = excluded.flag_regex, auth_required = excluded.auth_required,
                 accounts = excluded.accounts",
            params![
                settings.server_address,
                settings.flag_regex,
                settings.auth_required,
                to_json(&settings.accounts)?,
            ],
        )?;
        Ok(())
    }
}

const CONNECTION_SELECT: &str = "SELECT id, ip_src, port_src, ip_dst, port_dst, started_at, \
     closed_at, client_bytes, server_bytes, client_documents, server_documents, processed_at, \
     matched_rules, service_port, marked, hidden FROM connections";

const SESSION_SELECT: &str = "SELECT id, started_at, completed_at, size, processed_packets, \
     invalid_packets, packets_per_service, source FROM pcap_sessions";

fn connection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Connection>> {
    let id: i64 = row.get(0)?;
    let ip_src: String = row.get(1)?;
    let port_src: u16 = row.get(2)?;
    let ip_dst: String = row.get(3)?;
    let port_dst: u16 = row.get(4)?;
    let started_at: i64 = row.get(5)?;
    let closed_at: i64 = row.get(6)?;
    let client_bytes: i64 = row.get(7)?;
    let server_bytes: i64 = row.get(8)?;
    let client_documents: i64 = row.get(9)?;
    let server_documents: i64 = row.get(10)?;
    let processed_at: i64 = row.get(11)?;
    let matched_rules: String = row.get(12)?;
    let service_port: u16 = row.get(13)?;
    let marked: bool = row.get(14)?;
    let hidden: bool = row.get(15)?;

    Ok(build_connection(
        id,
        ip_src,
        port_src,
        ip_dst,
        port_dst,
        started_at,
        closed_at,
        client_bytes,
        server_bytes,
        client_documents,
        server_documents,
        processed_at,
        matched_rules,
        service_port,
        marked,
        hidden,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_connection(
    id: i64,
    ip_src: String,
    port_src: u16,
    ip_dst: String,
    port_dst: u16,
    started_at: i64,
    closed_at: i64,
    client_bytes: i64,
    server_bytes: i64,
    client_documents: i64,
    server_documents: i64,
    processed_at: i64,
    matched_rules: String,
    service_port: u16,
    marked: bool,
    hidden: bool,
) -> Result<Connection> {
    Ok(Connection {
        id: RowId(id),
        ip_src: ip_src
            .parse()
            .map_err(|_| CaronteError::Internal(format!("bad ip_src in store: {}", ip_src)))?,
        port_src,
        ip_dst: ip_dst
            .parse()
            .map_err(|_| CaronteError::Internal(format!("bad ip_dst in store: {}", ip_dst)))?,
        port_dst,
        started_at: millis_to_datetime(started_at)?,
        closed_at: millis_to_datetime(closed_at)?,
        client_bytes: client_bytes as u64,
        server_bytes: server_bytes as u64,
        client_documents: client_documents as usize,
        server_documents: server_documents as usize,
        processed_at: millis_to_datetime(processed_at)?,
        matched_rules: from_json(&matched_rules)?,
        service_port,
        marked,
        hidden,
    })
}

fn stream_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ConnectionStream>> {
    let id: i64 = row.get(0)?;
    let connection_id: i64 = row.get(1)?;
    let from_client: bool = row.get(2)?;
    let document_index: i64 = row.get(3)?;
    let payload: Vec<u8> = row.get(4)?;
    let blocks_indexes: String = row.get(5)?;
    let blocks_timestamps: String = row.get(6)?;
    let blocks_loss: String = row.get(7)?;
    let pattern_matches: String = row.get(8)?;
    let scanned_version: i64 = row.get(9)?;

    Ok((|| {
        Ok(ConnectionStream {
            id: RowId(id),
            connection_id: RowId(connection_id),
            from_client,
            document_index: document_index as usize,
            payload,
            blocks_indexes: from_json(&blocks_indexes)?,
            blocks_timestamps: from_json(&blocks_timestamps)?,
            blocks_loss: from_json(&blocks_loss)?,
            pattern_matches: from_json(&pattern_matches)?,
            scanned_version: scanned_version as u64,
        })
    })())
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PcapSession>> {
    let id: i64 = row.get(0)?;
    let started_at: i64 = row.get(1)?;
    let completed_at: Option<i64> = row.get(2)?;
    let size: i64 = row.get(3)?;
    let processed_packets: i64 = row.get(4)?;
    let invalid_packets: i64 = row.get(5)?;
    let packets_per_service: String = row.get(6)?;
    let source: String = row.get(7)?;

    Ok((|| {
        Ok(PcapSession {
            id: RowId(id),
            started_at: millis_to_datetime(started_at)?,
            completed_at: completed_at.map(millis_to_datetime).transpose()?,
            size: size as u64,
            processed_packets: processed_packets as u64,
            invalid_packets: invalid_packets as u64,
            packets_per_service: from_json(&packets_per_service)?,
            source: source
                .parse::<SessionSource>()
                .map_err(CaronteError::Internal)?,
        })
    })())
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CaronteError::Internal(format!("bad timestamp in store: {}", millis)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CaronteError::Internal(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|e| CaronteError::Internal(e.to_string()))
}
