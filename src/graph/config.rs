//! Per-graph playback configuration.

/// What a graph is asked to play: an ordered run of URIs of the same
/// content kind, plus initial rendering settings.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// The URIs, played in order. All entries must be handled by the same
    /// graph; the manager partitions its playlist accordingly.
    pub uris: Vec<String>,
    /// Index of the entry to start with.
    pub start: usize,
    /// Whether the list wraps around at either end.
    pub loop_list: bool,
    /// Whether a finished track replays instead of advancing.
    pub loop_track: bool,
    /// Initial rendering volume, 0..=100.
    pub volume: u32,
}

impl GraphConfig {
    /// A configuration for a single URI with default settings.
    pub fn single(uri: impl Into<String>) -> Self {
        Self {
            uris: vec![uri.into()],
            start: 0,
            loop_list: false,
            loop_track: false,
            volume: 75,
        }
    }

    /// A configuration for an ordered list of URIs.
    pub fn list(uris: Vec<String>) -> Self {
        Self {
            uris,
            start: 0,
            loop_list: false,
            loop_track: false,
            volume: 75,
        }
    }
}
