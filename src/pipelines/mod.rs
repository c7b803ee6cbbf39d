pub mod demux;
pub mod main_handler;
pub mod sample_manager;
pub mod stages;
