//! CSV front end used by the command-line desk.

pub mod action_reader;
pub mod report_writer;
pub mod seed_reader;
