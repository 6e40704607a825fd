//! # Pipeline Steps
//!
//! The concrete incoming and outgoing step implementations the bus wires
//! together at build time.
//!
//! Incoming order: deserialize → handle deferred → activate handlers →
//! load saga data → dispatch → save saga data. The outbox flush is not a
//! step; it rides the transaction commit.
//!
//! Outgoing order: assign default headers → auto-correlate → serialize →
//! send.

pub mod incoming;
pub mod outgoing;

pub use incoming::{
    ActivateHandlersStep, DeserializeStep, DispatchIncomingMessageStep, HandleDeferredMessagesStep,
    LoadSagaDataStep, SaveSagaDataStep,
};
pub use outgoing::{
    AssignDefaultHeadersStep, AutoCorrelateStep, SendOutgoingMessageStep, SerializeStep,
};
