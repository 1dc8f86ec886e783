//! Output rendering for the command line.

mod generator;

pub use generator::{generate_json, render_packet, render_status, render_verification, write_output};
