//! Real-time delivery over WebSocket
//!
//! `Hub` tracks sockets per user, `TypingTracker` holds short-lived typing
//! state, and `socket` runs one task pair per connection.

pub mod events;
pub mod hub;
pub mod socket;
pub mod typing;

pub use events::{ClientEvent, ServerEvent};
pub use hub::Hub;
pub use typing::TypingTracker;

use crate::config::AppState;
use crate::models::TypingIndicator;
use tracing::warn;

/// Forward a typing change to everyone in the conversation but the typer
pub async fn relay_typing(state: &AppState, indicator: TypingIndicator) {
    let participants = match state
        .conversations
        .participant_ids(&indicator.conversation_id)
        .await
    {
        Ok(ids) => ids,
        Err(e) => {
            warn!(
                "[Typing] Could not load participants of {}: {}",
                indicator.conversation_id, e
            );
            return;
        }
    };

    let typer = indicator.user_id.clone();
    state.hub.send_to_users(
        participants.iter().filter(|id| **id != typer),
        &ServerEvent::Typing(indicator),
    );
}
