pub mod balance;
pub mod browser;
pub mod connector;
pub mod contracts;
pub mod markers;
pub mod messaging;
pub mod network;
