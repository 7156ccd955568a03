//! Held-key list: 128 array-backed entries linked in press order.

const NONE: u8 = u8::MAX;

/// Keys currently held on a part, oldest first.
///
/// Pressing a held key moves it to the tail; releasing unlinks it. The tail
/// is the most recent key still held, used as the fallback on release.
#[derive(Debug, Clone)]
pub struct HeldKeyList {
    prev: [u8; 128],
    next: [u8; 128],
    held: [bool; 128],
    head: u8,
    tail: u8,
    len: usize,
}

impl Default for HeldKeyList {
    fn default() -> Self {
        Self {
            prev: [NONE; 128],
            next: [NONE; 128],
            held: [false; 128],
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }
}

impl HeldKeyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, note: u8) -> bool {
        note < 128 && self.held[note as usize]
    }

    pub fn head(&self) -> Option<u8> {
        (self.head != NONE).then_some(self.head)
    }

    pub fn tail(&self) -> Option<u8> {
        (self.tail != NONE).then_some(self.tail)
    }

    /// Append `note`, moving it to the tail if already held.
    pub fn press(&mut self, note: u8) {
        if note >= 128 {
            return;
        }
        if self.held[note as usize] {
            self.unlink(note);
        }
        let index = note as usize;
        self.held[index] = true;
        self.prev[index] = self.tail;
        self.next[index] = NONE;
        if self.tail == NONE {
            self.head = note;
        } else {
            self.next[self.tail as usize] = note;
        }
        self.tail = note;
        self.len += 1;
    }

    /// Remove `note`. Returns whether it was held.
    pub fn release(&mut self, note: u8) -> bool {
        if !self.contains(note) {
            return false;
        }
        self.unlink(note);
        true
    }

    fn unlink(&mut self, note: u8) {
        let index = note as usize;
        let prev = self.prev[index];
        let next = self.next[index];
        if prev == NONE {
            self.head = next;
        } else {
            self.next[prev as usize] = next;
        }
        if next == NONE {
            self.tail = prev;
        } else {
            self.prev[next as usize] = prev;
        }
        self.prev[index] = NONE;
        self.next[index] = NONE;
        self.held[index] = false;
        self.len -= 1;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Held keys in press order, oldest first.
    pub fn iter(&self) -> HeldKeys<'_> {
        HeldKeys {
            list: self,
            at: self.head,
        }
    }
}

pub struct HeldKeys<'a> {
    list: &'a HeldKeyList,
    at: u8,
}

impl Iterator for HeldKeys<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.at == NONE {
            return None;
        }
        let note = self.at;
        self.at = self.list.next[note as usize];
        Some(note)
    }
}
