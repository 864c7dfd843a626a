use std::collections::VecDeque;

use rand::Rng;

use crate::protocol::Track;

/// Playback history is capped; oldest entries fall off.
const HISTORY_LIMIT: usize = 20;

/// What happens when a track finishes naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Linear playback.
    #[default]
    None,
    /// Replay the current track.
    Track,
    /// Cycle the upcoming list, re-appending finished tracks to the tail.
    Queue,
}

/// Per-player track queue: upcoming tracks, the current track and a bounded
/// most-recent-first history.
#[derive(Debug, Default)]
pub struct Queue {
    upcoming: VecDeque<Track>,
    current: Option<Track>,
    history: VecDeque<Track>,
    loop_mode: LoopMode,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn upcoming(&self) -> impl Iterator<Item = &Track> {
        self.upcoming.iter()
    }

    /// Most recent first.
    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.history.iter()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    /// Upcoming tracks only; `current` is not counted.
    pub fn len(&self) -> usize {
        self.upcoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upcoming.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.history.len() + self.upcoming.len() + usize::from(self.current.is_some())
    }

    /// Append, or insert at `position` (clamped to the tail).
    pub fn add(&mut self, track: Track, position: Option<usize>) {
        match position {
            Some(index) if index < self.upcoming.len() => self.upcoming.insert(index, track),
            _ => self.upcoming.push_back(track),
        }
    }

    pub fn add_many(&mut self, tracks: Vec<Track>, position: Option<usize>) {
        match position {
            Some(index) if index < self.upcoming.len() => {
                for (offset, track) in tracks.into_iter().enumerate() {
                    self.upcoming.insert(index + offset, track);
                }
            }
            _ => self.upcoming.extend(tracks),
        }
    }

    /// Next track to play, honoring the loop mode.
    pub fn poll(&mut self) -> Option<Track> {
        match self.loop_mode {
            LoopMode::Track => self.current.clone(),
            LoopMode::Queue => {
                if let Some(current) = self.current.take() {
                    self.upcoming.push_back(current);
                }
                self.current = self.upcoming.pop_front();
                self.current.clone()
            }
            LoopMode::None => {
                let next = self.upcoming.pop_front()?;
                self.advance_to(Some(next.clone()));
                Some(next)
            }
        }
    }

    /// First upcoming track without consuming it.
    pub fn peek(&self) -> Option<&Track> {
        self.upcoming.front()
    }

    /// Replace `current`, pushing the previous one onto history. Clearing to
    /// `None` records nothing.
    pub fn advance_to(&mut self, track: Option<Track>) {
        if let Some(previous) = self.current.take() {
            if track.is_some() {
                self.push_history(previous);
            }
        }
        self.current = track;
    }

    /// Retire the current track into history (track-end path).
    pub fn finish_current(&mut self) -> Option<Track> {
        let finished = self.current.take()?;
        self.push_history(finished.clone());
        Some(finished)
    }

    fn push_history(&mut self, track: Track) {
        self.history.push_front(track);
        self.history.truncate(HISTORY_LIMIT);
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Track> {
        self.upcoming.remove(index)
    }

    /// Remove the first upcoming track with the same encoded blob.
    pub fn remove(&mut self, track: &Track) -> Option<Track> {
        let index = self
            .upcoming
            .iter()
            .position(|t| t.encoded == track.encoded)?;
        self.upcoming.remove(index)
    }

    pub fn clear(&mut self) {
        self.upcoming.clear();
        self.history.clear();
        self.current = None;
    }

    /// In-place Fisher–Yates over upcoming only.
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        for i in (1..self.upcoming.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.upcoming.swap(i, j);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
