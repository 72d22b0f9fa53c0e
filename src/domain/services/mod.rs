pub mod drain;
pub mod events;
pub mod ledger;
pub mod relay;
pub mod supervisor;
pub mod transport;
