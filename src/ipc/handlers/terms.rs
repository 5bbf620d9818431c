use crate::ipc::error::ok;
use crate::ipc::helpers::{db_err, get_opt_bool, get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const TERM_NAMES: [&str; 3] = ["First", "Second", "Third"];

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session = get_required_str(params, "session")?;
    let name = get_required_str(params, "name")?;
    let is_current = get_opt_bool(params, "isCurrent")?.unwrap_or(false);

    if session.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "session must be non-empty"));
    }
    if !TERM_NAMES.contains(&name.as_str()) {
        return Err(HandlerErr::new(
            "bad_params",
            "name must be First, Second or Third",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    if is_current {
        tx.execute("UPDATE terms SET is_current = 0 WHERE is_current = 1", [])
            .map_err(db_err)?;
    }
    let id = Uuid::new_v4().to_string();
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO terms(id, session, name, is_current, created_at)
         VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, session.trim(), &name, is_current as i64),
    )
    .map_err(db_err)?;
    if inserted == 0 {
        return Err(HandlerErr::new(
            "bad_params",
            "term already exists for that session",
        ));
    }
    tx.commit().map_err(db_err)?;

    Ok(json!({ "termId": id }))
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, session, name, is_current
             FROM terms ORDER BY session, name",
        )
        .map_err(db_err)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([], |r| {
            Ok(json!({
                "termId": r.get::<_, String>(0)?,
                "session": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "isCurrent": r.get::<_, i64>(3)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "terms": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |state: &AppState, f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        match require_db(state).and_then(|conn| f(conn, &req.params)) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "terms.create" => Some(run(state, create)),
        "terms.list" => Some(run(state, list)),
        _ => None,
    }
}
