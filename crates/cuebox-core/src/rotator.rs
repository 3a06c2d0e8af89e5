//! Background playlist of the active theme.
//!
//! Every file of every background cue goes into one flat pool, played in
//! shuffled order. A bounded history backs `previous`; tracks stepped back
//! over are kept on a return stack so `advance` replays them in order
//! before touching the shuffle again.

use rand::seq::SliceRandom;
use rand::Rng;

/// How many previously played tracks `previous` can walk back through.
pub const HISTORY_DEPTH: usize = 10;

/// One file of one background cue, by index into the theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Track {
    pub cue: usize,
    pub file: usize,
}

/// Fixed-capacity LIFO that forgets its oldest entry when full.
#[derive(Debug)]
struct HistoryRing<T> {
    buf: Vec<Option<T>>,
    write_pos: usize,
    len: usize,
}

impl<T: Copy + PartialEq> HistoryRing<T> {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![None; capacity],
            write_pos: 0,
            len: 0,
        }
    }

    fn push(&mut self, item: T) {
        let cap = self.buf.len();
        if cap == 0 {
            return;
        }
        self.buf[self.write_pos] = Some(item);
        self.write_pos = (self.write_pos + 1) % cap;
        self.len = (self.len + 1).min(cap);
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.buf.len();
        self.write_pos = (self.write_pos + cap - 1) % cap;
        self.len -= 1;
        self.buf[self.write_pos].take()
    }

    /// Oldest first.
    fn items(&self) -> Vec<T> {
        let cap = self.buf.len();
        (0..self.len)
            .filter_map(|i| self.buf[(self.write_pos + cap - self.len + i) % cap])
            .collect()
    }

    fn retain(&mut self, keep: impl Fn(&T) -> bool) {
        let items = self.items();
        self.clear();
        for item in items.into_iter().filter(|t| keep(t)) {
            self.push(item);
        }
    }

    fn clear(&mut self) {
        self.buf.iter_mut().for_each(|s| *s = None);
        self.write_pos = 0;
        self.len = 0;
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug)]
pub struct Rotator {
    pool: Vec<Track>,
    order: Vec<Track>,
    cursor: usize,
    current: Option<Track>,
    history: HistoryRing<Track>,
    upcoming: Vec<Track>,
}

impl Rotator {
    pub fn new(pool: Vec<Track>) -> Self {
        Self {
            pool,
            order: Vec::new(),
            cursor: 0,
            current: None,
            history: HistoryRing::new(HISTORY_DEPTH),
            upcoming: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<Track> {
        self.current
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Forget history, reshuffle and pick the first track.
    pub fn restart<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Track> {
        self.forget_history();
        let last = self.current.take();
        self.reshuffle(rng, last);
        self.current = self.next_in_order(rng, last);
        self.current
    }

    /// Drop history and the return stack, keeping the current track.
    pub fn forget_history(&mut self) {
        self.history.clear();
        self.upcoming.clear();
    }

    /// Move to the next track. The outgoing one joins the history.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Track> {
        let last = self.current.take();
        if let Some(track) = last {
            self.history.push(track);
        }
        self.current = match self.upcoming.pop() {
            Some(track) => Some(track),
            None => self.next_in_order(rng, last),
        };
        self.current
    }

    /// Step back one track. `None` (and no change) when history is empty.
    pub fn previous(&mut self) -> Option<Track> {
        let prev = self.history.pop()?;
        if let Some(track) = self.current.take() {
            self.upcoming.push(track);
        }
        self.current = Some(prev);
        self.current
    }

    /// Drop an unreadable track everywhere. Returns true once the pool is empty.
    pub fn remove(&mut self, track: Track) -> bool {
        self.pool.retain(|t| *t != track);
        if let Some(pos) = self.order.iter().position(|t| *t == track) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
        self.upcoming.retain(|t| *t != track);
        self.history.retain(|t| *t != track);
        if self.current == Some(track) {
            self.current = None;
        }
        self.pool.is_empty()
    }

    fn next_in_order<R: Rng + ?Sized>(&mut self, rng: &mut R, last: Option<Track>) -> Option<Track> {
        if self.cursor >= self.order.len() {
            self.reshuffle(rng, last);
        }
        let track = self.order.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(track)
    }

    fn reshuffle<R: Rng + ?Sized>(&mut self, rng: &mut R, last: Option<Track>) {
        self.order = self.pool.clone();
        self.cursor = 0;
        self.order.shuffle(rng);
        if self.order.len() >= 2 {
            while self.order.first().copied() == last {
                self.order.shuffle(rng);
            }
        }
    }
}
