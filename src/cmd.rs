mod profile_cmd;

pub use profile_cmd::*;
