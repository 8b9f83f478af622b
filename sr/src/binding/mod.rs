//! Device binding
//!
//! Associates a physical device (and its user) with a destination through a
//! single-use, time-boxed token the device reads from an optical code.

mod decoder;
mod error;
mod handshake;
mod offers;

pub use decoder::{DecodeError, HttpDecoder, OpticalDecoder};
pub use error::BindingError;
pub use handshake::{BindingHandshake, BindingOutcome, OFFER_MESSAGE, TAKE_PHOTO};
pub use offers::BindingOffers;
