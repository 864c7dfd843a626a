pub mod info;
pub mod messages;
pub mod player;
pub mod session;
pub mod stats;
pub mod tracks;
pub mod voice;

pub use info::{Info, Version};
pub use messages::{IncomingMessage, NodeEvent, TrackEndReason, TrackException};
pub use player::{EndTime, Filters, PlayerInfo, PlayerState, PlayerUpdate, TrackEncoded, VoiceState};
pub use session::{SessionInfo, SessionUpdate};
pub use stats::{FrameStats, Stats};
pub use tracks::{LoadError, LoadResult, PlaylistData, PlaylistInfo, Track, TrackInfo};
pub use voice::{VoiceServerUpdate, VoiceStateUpdate, normalize_endpoint};
