//! The portal's HTTP/WS surface.
//!
//! Routes translate external calls into registry/orchestrator/speech/hub
//! operations. All error responses are JSON `{error, message}` bodies. The
//! wire surface accepts both `session` and `room` spellings of every path.

pub mod control;
pub mod routes;
pub mod sessions;
pub mod terminal;
pub mod types;
pub mod ws;

use std::sync::Arc;

use crate::error::{PortalError, Result};
use crate::hub::RoomChannel;
use crate::registry::{Room, RoomId};

use self::routes::AppState;

/// Resolve a raw path parameter into a known room and its hub channel.
///
/// Unknown rooms trigger one coalesced reconcile of their host before
/// failing, so sessions created out-of-band are picked up on first contact.
pub async fn resolve_room(state: &AppState, raw: &str) -> Result<(Room, Arc<RoomChannel>)> {
    let id = RoomId::parse(raw)?;
    let key = id.canonical();
    if !state.registry.contains(&key).await {
        let _ = state.registry.reconcile(&id.host, false).await;
    }
    let room = state
        .registry
        .get(&key)
        .await
        .ok_or_else(|| PortalError::NotFound(format!("session '{}'", key)))?;
    let channel = state.hub.channel(&key).await;
    Ok((room, channel))
}
