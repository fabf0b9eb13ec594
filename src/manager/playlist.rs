//! The playlist: the URL iterator driving the playback manager.
//!
//! The manager only ever walks forward through a track source; jumping
//! backward within a run of same-kind tracks is the graph's business. A
//! source is restartable from the beginning but not arbitrarily seekable.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;

/// One playable entry.
#[derive(Debug, Clone)]
pub struct Track {
    /// The content URI.
    pub uri: String,
    /// Service-provided metadata, merged with whatever the probe finds.
    pub metadata: BTreeMap<String, String>,
}

impl Track {
    /// A track with no upfront metadata.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// An ordered source of tracks.
///
/// Implementations speak whatever protocol produces the URLs (a local
/// file list, a streaming service's API) and surface per-element errors
/// lazily, when the element is actually opened.
pub trait TrackSource: Send + 'static {
    /// The tracks from the cursor to the end of the iteration order,
    /// without advancing.
    fn upcoming(&self) -> Vec<Track>;

    /// Consumes `n` tracks, clamped to the end.
    fn advance(&mut self, n: usize);

    /// Rewinds to the beginning of the iteration order.
    fn restart(&mut self);

    /// Whether the cursor is past the last track.
    fn exhausted(&self) -> bool;

    /// Total number of tracks, when known.
    fn len(&self) -> usize;

    /// Whether the source has no tracks at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reorders the not-yet-played tail randomly (or restores list
    /// order). Sources without a meaningful order may ignore this.
    fn set_shuffle(&mut self, shuffle: bool) {
        let _ = shuffle;
    }

    /// Whether shuffle is in effect.
    fn shuffled(&self) -> bool {
        false
    }
}

/// A finite, in-memory playlist.
#[derive(Debug)]
pub struct Playlist {
    entries: Vec<Track>,
    /// Play order, as indices into `entries`.
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
}

impl Playlist {
    /// Builds a playlist from URIs, in the given order.
    pub fn from_uris<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries: Vec<Track> = uris.into_iter().map(Track::new).collect();
        let order = (0..entries.len()).collect();
        Self {
            entries,
            order,
            cursor: 0,
            shuffle: false,
        }
    }

    /// Builds a playlist from tracks.
    pub fn from_tracks(entries: Vec<Track>) -> Self {
        let order = (0..entries.len()).collect();
        Self {
            entries,
            order,
            cursor: 0,
            shuffle: false,
        }
    }
}

impl TrackSource for Playlist {
    fn upcoming(&self) -> Vec<Track> {
        self.order[self.cursor.min(self.order.len())..]
            .iter()
            .map(|&i| self.entries[i].clone())
            .collect()
    }

    fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.order.len());
    }

    fn restart(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut rand::rng());
        }
    }

    fn exhausted(&self) -> bool {
        self.cursor >= self.order.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
        if shuffle {
            // Only the unplayed tail moves; history keeps its order.
            self.order[self.cursor..].shuffle(&mut rand::rng());
        } else {
            let played: Vec<usize> = self.order[..self.cursor].to_vec();
            let mut rest: Vec<usize> =
                (0..self.entries.len()).filter(|i| !played.contains(i)).collect();
            rest.sort_unstable();
            self.order = played;
            self.order.extend(rest);
        }
    }

    fn shuffled(&self) -> bool {
        self.shuffle
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn walks_in_order_and_exhausts() {
        let mut p = Playlist::from_uris(["a", "b", "c"]);
        assert_eq!(p.len(), 3);
        assert_eq!(p.upcoming().len(), 3);
        assert_eq!(p.upcoming()[0].uri, "a");

        p.advance(2);
        assert_eq!(p.upcoming()[0].uri, "c");
        assert!(!p.exhausted());

        p.advance(5);
        assert!(p.exhausted());
        assert!(p.upcoming().is_empty());

        p.restart();
        assert_eq!(p.upcoming()[0].uri, "a");
    }

    #[test]
    fn shuffle_keeps_the_tail_complete() {
        let mut p = Playlist::from_uris(["a", "b", "c", "d", "e"]);
        p.advance(2);
        p.set_shuffle(true);

        let tail: BTreeSet<String> = p.upcoming().into_iter().map(|t| t.uri).collect();
        let expected: BTreeSet<String> =
            ["c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tail, expected);

        p.set_shuffle(false);
        let tail: Vec<String> = p.upcoming().into_iter().map(|t| t.uri).collect();
        assert_eq!(tail, ["c", "d", "e"]);
    }
}
