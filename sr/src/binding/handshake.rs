//! Binding handshake over the relay's own stream
//!
//! Offer: an unresolvable request is answered with instructions and a
//! `take_photo` tool call, and the stream ID is marked as awaiting evidence.
//! Resolve: a later request on the same stream from the same device carrying
//! an image is decoded, and the payload is redeemed as a binding token.

use std::sync::Arc;

use tracing::{info, warn};

use super::decoder::OpticalDecoder;
use super::error::BindingError;
use super::offers::BindingOffers;
use crate::domain::{Destination, now_ms};
use crate::protocol::{AgentMessage, EVENT_DONE, EVENT_MESSAGE};
use crate::state::{StateError, StateManager};
use crate::transport::{Transport, TransportError};

pub const OFFER_MESSAGE: &str = "Hello! Open the destination page in your browser to show its binding code, then take a photo of the code with your glasses to finish binding.";

pub const TAKE_PHOTO: &str = "take_photo";

fn success_message(dest: &Destination) -> String {
    format!("Binding succeeded! You can now use {}. Refresh the page to see the binding status.", dest.name)
}

/// Result of a resolve attempt
#[derive(Debug)]
pub enum BindingOutcome {
    Bound(Destination),
    Rejected(BindingError),
}

/// Drives the offer/resolve exchange
#[derive(Clone)]
pub struct BindingHandshake {
    state: StateManager,
    offers: Arc<BindingOffers>,
    decoder: Arc<dyn OpticalDecoder>,
}

impl BindingHandshake {
    pub fn new(state: StateManager, offers: Arc<BindingOffers>, decoder: Arc<dyn OpticalDecoder>) -> Self {
        Self { state, offers, decoder }
    }

    pub fn offers(&self) -> &Arc<BindingOffers> {
        &self.offers
    }

    /// Whether this request continues an offer made to the same device
    pub fn is_awaiting(&self, stream_id: &str, device_id: &str) -> bool {
        self.offers.is_awaiting(stream_id, device_id)
    }

    /// Ask the device for a photo of its binding code
    pub async fn offer<T: Transport>(
        &self,
        transport: &mut T,
        stream_id: &str,
        device_id: &str,
    ) -> Result<(), TransportError> {
        info!(%stream_id, %device_id, "No destination bound, offering binding");
        self.offers.offer(stream_id, device_id);

        let steps = [
            AgentMessage::answer(stream_id, device_id, OFFER_MESSAGE, false),
            AgentMessage::tool_call(stream_id, device_id, TAKE_PHOTO),
            AgentMessage::answer(stream_id, device_id, "", true),
        ];
        for msg in &steps {
            transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
        }
        transport
            .write_event(EVENT_DONE, &AgentMessage::done(stream_id, device_id).to_value())
            .await
    }

    /// Decode the photo and redeem its token; the offer is cleared either way
    pub async fn resolve<T: Transport>(
        &self,
        transport: &mut T,
        stream_id: &str,
        device_id: &str,
        user_id: Option<&str>,
        image_url: &str,
    ) -> Result<BindingOutcome, TransportError> {
        info!(%stream_id, %device_id, "Resolving binding photo");
        let outcome = self.redeem(device_id, user_id, image_url).await;
        self.offers.clear(stream_id);

        let text = match outcome {
            BindingOutcome::Bound(ref dest) => {
                info!(dest_id = %dest.id, %device_id, ?user_id, "Device bound");
                success_message(dest)
            }
            BindingOutcome::Rejected(ref e) => {
                warn!(error = %e, %device_id, "Binding rejected");
                e.user_message().to_string()
            }
        };

        let msg = AgentMessage::answer(stream_id, device_id, text, true);
        transport.write_event(EVENT_MESSAGE, &msg.to_value()).await?;
        transport
            .write_event(EVENT_DONE, &AgentMessage::done(stream_id, device_id).to_value())
            .await?;
        Ok(outcome)
    }

    async fn redeem(&self, device_id: &str, user_id: Option<&str>, image_url: &str) -> BindingOutcome {
        let payload = match self.decoder.decode(image_url).await {
            Ok(payload) => payload,
            Err(e) => return BindingOutcome::Rejected(BindingError::Unreadable(e.to_string())),
        };

        match self.state.bind_with_token(&payload, device_id, user_id, now_ms()).await {
            Ok(dest) => BindingOutcome::Bound(dest),
            Err(StateError::Binding(e)) => BindingOutcome::Rejected(e),
            Err(e) => BindingOutcome::Rejected(BindingError::Failed(e.to_string())),
        }
    }
}
