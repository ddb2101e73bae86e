use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Opens (or creates) a component's embedded database file with the
/// write-ahead-log/NORMAL-durability pragmas every `.db` in the
/// persistence layout shares.
pub fn open_component_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Blob encoding for `Vec<f32>` columns, little-endian, matching the
/// embedding-as-blob convention used throughout the persistence layer.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
