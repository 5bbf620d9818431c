use crate::grading::{recompute_class_ranking, RankingContext};
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn recompute(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_name = get_required_str(params, "className")?;
    let term_id = get_required_str(params, "termId")?;

    let ctx = RankingContext {
        conn,
        class_name: &class_name,
        term_id: &term_id,
    };
    let outcome = recompute_class_ranking(&ctx)?;
    Ok(json!({ "ranking": outcome }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ranking.recompute" => Some(
            match require_db(state).and_then(|conn| recompute(conn, &req.params)) {
                Ok(result) => ok(&req.id, result),
                Err(e) => e.response(&req.id),
            },
        ),
        _ => None,
    }
}
