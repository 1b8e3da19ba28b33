/// Shared types for dlrelay: models, errors, yt-dlp parameter translation
/// and the upstream event-stream protocol.
pub mod errors;
pub mod models;
pub mod params;
pub mod sse;
