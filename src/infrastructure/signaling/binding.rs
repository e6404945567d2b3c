//! Routes hub traffic into the engine mailbox

use super::hub::HubConnection;
use crate::application::EngineHandle;
use crate::domain::signaling::SignalingEvent;
use tracing::warn;

/// Subscribe the engine to every inbound relay event and to the
/// connection lifecycle of `hub`. Undecodable input is reported on the
/// status broadcast.
pub fn bind(hub: &HubConnection, engine: &EngineHandle) {
    for name in SignalingEvent::INBOUND {
        let engine = engine.clone();
        hub.on(name, move |args| match SignalingEvent::from_invocation(name, args) {
            Ok(event) => engine.dispatch(event),
            Err(e) => {
                warn!("Dropping malformed {} event: {}", name, e);
                engine.status().error(&e);
            }
        });
    }

    let engine_on_frame_error = engine.clone();
    hub.on_frame_error(move |e| engine_on_frame_error.status().error(e));

    let engine_on_reconnecting = engine.clone();
    hub.on_reconnecting(move |error| {
        engine_on_reconnecting.dispatch(SignalingEvent::Reconnecting { error })
    });

    let engine_on_reconnected = engine.clone();
    hub.on_reconnected(move |connection_id| {
        engine_on_reconnected.dispatch(SignalingEvent::Reconnected { connection_id })
    });

    let engine_on_close = engine.clone();
    hub.on_close(move |error| engine_on_close.dispatch(SignalingEvent::Closed { error }));
}
