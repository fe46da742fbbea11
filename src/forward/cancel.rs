//! Per-endpoint stream cancellation and the manual "current endpoint" switch
//! entry point (§4.1, §4.5).
//!
//! Each endpoint name gets a `watch<bool>` "cancelled" signal, created on
//! first use. A manual switch away from an endpoint flips its signal so any
//! in-flight stream still bound to it stops forwarding bytes; the endpoint
//! then gets a fresh, uncancelled signal so a later pick of the same name
//! doesn't start out pre-cancelled.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tokio::sync::watch;

use crate::config::ClientKind;

struct CancelState {
    tokens: HashMap<String, watch::Sender<bool>>,
    current: HashMap<ClientKind, String>,
}

static STATE: Lazy<Mutex<CancelState>> = Lazy::new(|| {
    Mutex::new(CancelState {
        tokens: HashMap::new(),
        current: HashMap::new(),
    })
});

fn sender_for(state: &mut CancelState, endpoint_name: &str) -> watch::Sender<bool> {
    state
        .tokens
        .entry(endpoint_name.to_string())
        .or_insert_with(|| watch::channel(false).0)
        .clone()
}

/// Receiver a streaming handler polls before forwarding each chunk: true
/// means the endpoint this stream is bound to has been switched away from.
pub fn cancel_receiver(endpoint_name: &str) -> watch::Receiver<bool> {
    let mut state = STATE.lock().unwrap();
    sender_for(&mut state, endpoint_name).subscribe()
}

/// Called on every automatic router selection to keep "current" accurate.
/// Unlike `switch_endpoint`, this never cancels anything.
pub fn set_current(client_kind: ClientKind, endpoint_name: &str) {
    STATE
        .lock()
        .unwrap()
        .current
        .insert(client_kind, endpoint_name.to_string());
}

#[allow(dead_code)]
pub fn current_endpoint(client_kind: ClientKind) -> Option<String> {
    STATE.lock().unwrap().current.get(&client_kind).cloned()
}

/// Manual switch entry point (§4.1): pin `endpoint_name` as current for
/// `client_kind` and cancel whatever endpoint was current before it.
pub fn switch_endpoint(client_kind: ClientKind, endpoint_name: &str) {
    let mut state = STATE.lock().unwrap();
    let previous = state.current.insert(client_kind, endpoint_name.to_string());
    if let Some(previous) = previous {
        if previous != endpoint_name {
            let sender = sender_for(&mut state, &previous);
            let _ = sender.send(true);
            state.tokens.insert(previous, watch::channel(false).0);
        }
    }
    sender_for(&mut state, endpoint_name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_cancels_previous_not_new() {
        switch_endpoint(ClientKind::Codex, "cancel-test-a");
        let mut rx_a = cancel_receiver("cancel-test-a");
        switch_endpoint(ClientKind::Codex, "cancel-test-b");
        assert!(*rx_a.borrow_and_update());

        let mut rx_b = cancel_receiver("cancel-test-b");
        assert!(!*rx_b.borrow_and_update());
    }

    #[test]
    fn fresh_endpoint_starts_uncancelled() {
        let mut rx = cancel_receiver("cancel-test-fresh");
        assert!(!*rx.borrow_and_update());
    }
}
