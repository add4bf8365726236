//! Protocol exchanges. Each runs inside a [`Session`](super::Session) handed
//! out by the command pipeline.

pub mod directory;
pub mod get_file;
pub mod launch;
pub mod ping;
pub mod transfer;

pub use directory::{list_directory, parse_directory_listing};
pub use get_file::{get_file, FileFetch, MAX_FILE_LENGTH};
pub use launch::{classify_launch_response, launch, LaunchOutcome, LaunchResult};
pub use ping::{ping, reset, PingResult};
pub use transfer::{delete_file, transfer_files, TransferReport};
