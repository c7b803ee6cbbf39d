pub mod barcode;
pub mod channel;
pub mod command;
pub mod executor;
pub mod exporters;
pub mod fastx;
pub mod file;
pub mod filters;
pub mod logging;
pub mod sample;
pub mod scheme;
pub mod stats;
pub mod streams;
pub mod system;
pub mod work;
