mod collab;
mod config;
mod crawl;
mod data_io;
mod detect;
mod error;
mod fetch;
mod pipeline;
mod runtime;
mod store;
mod synth;
mod types;
mod verify;
mod webdriver;
mod widget;

pub use runtime::run;
