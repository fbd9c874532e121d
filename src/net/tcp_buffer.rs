// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Growable byte buffer with commit/consume cursors.
///
/// One backing array, a read cursor and a write cursor. The read task calls
/// `prepare` to reserve a writable window, fills it from the socket, then
/// `commit`s the bytes; the codec reads through `view` and `consume`s what it
/// parsed. Not thread-safe: each side of a connection owns one buffer and
/// touches it from a single task at a time.
#[derive(Debug)]
pub struct TcpBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl TcpBuffer {
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            buf: vec![0u8; capacity_hint.max(16)],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Reserves `n` writable bytes and returns the window. The contents are
    /// not considered part of the buffer until `commit` is called.
    pub fn prepare(&mut self, n: usize) -> &mut [u8] {
        self.compact();
        let need = self.write_pos + n;
        if self.buf.len() < need {
            self.buf.resize(need.next_power_of_two(), 0);
        }
        &mut self.buf[self.write_pos..self.write_pos + n]
    }

    /// Advances the write cursor after a socket read filled the prepared
    /// window. `k` must not exceed the prepared size.
    pub fn commit(&mut self, k: usize) {
        debug_assert!(self.write_pos + k <= self.buf.len());
        self.write_pos += k;
    }

    /// Advances the read cursor past `k` parsed bytes.
    pub fn consume(&mut self, k: usize) {
        debug_assert!(self.read_pos + k <= self.write_pos);
        self.read_pos += k;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// The readable bytes, without copying.
    pub fn view(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Appends already-encoded bytes (writer side of the connection).
    pub fn append(&mut self, data: &[u8]) {
        let window = self.prepare(data.len());
        window.copy_from_slice(data);
        self.commit(data.len());
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Shift unread bytes to the front once the dead prefix dominates, so the
    // backing array does not grow without bound on a long-lived connection.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        } else if self.read_pos > self.buf.len() / 2 {
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }
}
