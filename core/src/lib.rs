pub mod bus;
pub mod dma;
pub mod ncr;
pub mod scsi;
pub mod sim;
pub mod tickable;
pub mod types;
