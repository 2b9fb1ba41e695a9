// HLS pipeline for a single stream: playlist, keys, segments, merge.

pub mod decryption;
pub mod fetcher;
pub mod job;
pub mod merger;
pub mod playlist;
pub mod retry;
pub mod state;

pub use decryption::{Decryptor, KeyResolver, KeySet, derive_iv};
pub use fetcher::{PoolOutcome, SegmentPool};
pub use job::{HlsJob, JobOutcome};
pub use merger::{BinaryConcat, Concatenator, FfmpegConcat, Reassembler};
pub use playlist::{Playlist, PlaylistLoader, Segment, parse_playlist};
pub use state::{SegmentState, SegmentStatus, StateManager};
