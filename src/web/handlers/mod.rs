pub mod connections;
pub mod pcap;
pub mod rescan;
pub mod rules;
pub mod services;
pub mod setup;
pub mod streams;
