pub mod api;
pub mod connection;
pub mod controller;
pub mod dispatcher;
pub mod intent;
pub mod queue;
pub mod receiver;
pub mod sequencer;
pub mod transport;
