/// Application messages.
///
/// Payloads are opaque bytes. Applications read them through
/// [`Dispatcher::subscribe`]; this handler only keeps the flood going.
use std::sync::Arc;

use crate::dispatcher::{Dispatcher, HandlerTable, Inbound, SignalHandler};
use crate::signal::SignalType;

pub(crate) struct MessageHandler;

impl MessageHandler {
    pub(crate) fn register(table: &mut HandlerTable) {
        table.insert(SignalType::Message, Arc::new(MessageHandler));
    }
}

#[async_trait::async_trait]
impl SignalHandler for MessageHandler {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, inbound: Inbound) {
        if dispatcher.is_pending(&inbound.via) {
            tracing::debug!("Ignoring message relayed by pending peer {}", inbound.via);
            return;
        }
        if inbound.signal.recipient() == dispatcher.local() {
            return;
        }
        dispatcher.send(&inbound.signal);
    }
}
