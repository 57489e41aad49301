pub mod settlement_worker;

pub use settlement_worker::SettlementWorker;
